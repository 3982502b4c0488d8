/*
 * Licensed to the Apache Software Foundation (ASF) under one or more
 * contributor license agreements.  See the NOTICE file distributed with
 * this work for additional information regarding copyright ownership.
 * The ASF licenses this file to You under the Apache License, Version 2.0
 * (the "License"); you may not use this file except in compliance with
 * the License.  You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::result::Value;

/// One RPC call, described once by the caller-facing proxy layer and read
/// by every stage of the chain.
///
/// Attachments travel to the server; attributes are in-process context
/// passed explicitly through the chain (never thread-local). Clones share
/// both maps, so context added by one stage is observed by every other
/// holder of the call, post-completion hooks included.
#[derive(Clone)]
pub struct Invocation {
    service_name: String,
    handler_name: String,
    args: Vec<Value>,
    attachments: Arc<Mutex<HashMap<String, String>>>,
    attributes: Arc<Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>>,
    one_way: bool,
    async_return: bool,
    timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(service_name: &str, handler_name: &str, args: Vec<Value>) -> Self {
        Invocation {
            service_name: service_name.to_string(),
            handler_name: handler_name.to_string(),
            args,
            attachments: Arc::new(Mutex::new(HashMap::new())),
            attributes: Arc::new(Mutex::new(HashMap::new())),
            one_way: false,
            async_return: false,
            timeout: None,
        }
    }

    pub fn one_way(mut self) -> Self {
        self.one_way = true;
        self
    }

    pub fn async_return(mut self) -> Self {
        self.async_return = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    /// `service/handler`, the routing key the server dispatches on.
    pub fn handler_key(&self) -> String {
        format!("{}/{}", self.service_name, self.handler_name)
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way
    }

    pub fn is_async_return(&self) -> bool {
        self.async_return
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Snapshot of the attachments as they stand right now.
    pub fn attachments(&self) -> HashMap<String, String> {
        self.attachments
            .lock()
            .expect("attachment map poisoned")
            .clone()
    }

    pub fn attachment(&self, key: &str) -> Option<String> {
        self.attachments
            .lock()
            .expect("attachment map poisoned")
            .get(key)
            .cloned()
    }

    pub fn put_attachment(&self, key: &str, value: &str) {
        self.attachments
            .lock()
            .expect("attachment map poisoned")
            .insert(key.to_string(), value.to_string());
    }

    pub fn put_attribute<T: Any + Send + Sync>(&self, key: &str, value: Arc<T>) {
        self.attributes
            .lock()
            .expect("attribute map poisoned")
            .insert(key.to_string(), value);
    }

    pub fn attribute<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.attributes
            .lock()
            .expect("attribute map poisoned")
            .get(key)
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("service_name", &self.service_name)
            .field("handler_name", &self.handler_name)
            .field("args", &self.args.len())
            .field("one_way", &self.one_way)
            .finish()
    }
}
