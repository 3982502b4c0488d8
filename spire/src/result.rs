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
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use thiserror::Error;
use tokio::sync::Notify;

pub type Value = serde_json::Value;

/// Call-level failures, delivered to the caller inside a completed
/// [`RpcResponse`] rather than thrown.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("remote call failed: {0}")]
    Call(String),

    #[error("no available invoker for service {0}")]
    Unavailable(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("serialization failure: {0}")]
    Serialization(String),

    #[error("call rejected by filter: {0}")]
    Rejected(String),

    #[error("unknown handler {0}")]
    UnknownHandler(String),
}

/// The (re)writable outcome of one call. Filter `on_response` hooks may
/// mutate it in place, including failing an otherwise-successful call.
#[derive(Debug, Clone)]
pub struct RpcResponse {
    result: Result<Value, RpcError>,
    attachments: HashMap<String, String>,
}

impl RpcResponse {
    pub fn ok(value: Value) -> Self {
        RpcResponse {
            result: Ok(value),
            attachments: HashMap::new(),
        }
    }

    pub fn error(err: RpcError) -> Self {
        RpcResponse {
            result: Err(err),
            attachments: HashMap::new(),
        }
    }

    /// Empty success, used for one-way calls.
    pub fn empty() -> Self {
        Self::ok(Value::Null)
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn result(&self) -> Result<&Value, &RpcError> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        self.result
    }

    pub fn set_value(&mut self, value: Value) {
        self.result = Ok(value);
    }

    pub fn set_error(&mut self, err: RpcError) {
        self.result = Err(err);
    }

    pub fn attachments(&self) -> &HashMap<String, String> {
        &self.attachments
    }

    pub fn put_attachment(&mut self, key: &str, value: &str) {
        self.attachments.insert(key.to_string(), value.to_string());
    }
}

struct ResultShared {
    done: AtomicBool,
    cell: Mutex<Option<RpcResponse>>,
    notify: Notify,
}

/// Completion handle bound to one invocation.
///
/// Shared freely (any stage may await it), but completes at most once:
/// the second completion attempt is rejected, never re-delivered.
#[derive(Clone)]
pub struct RpcResult {
    shared: Arc<ResultShared>,
}

impl RpcResult {
    pub fn pending() -> Self {
        RpcResult {
            shared: Arc::new(ResultShared {
                done: AtomicBool::new(false),
                cell: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    pub fn completed(response: RpcResponse) -> Self {
        let result = Self::pending();
        result.complete(response);
        result
    }

    pub fn ok(value: Value) -> Self {
        Self::completed(RpcResponse::ok(value))
    }

    pub fn err(err: RpcError) -> Self {
        Self::completed(RpcResponse::error(err))
    }

    /// Completes the call. Returns false (and delivers nothing) when the
    /// result was already completed.
    pub fn complete(&self, response: RpcResponse) -> bool {
        if self.shared.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self
            .shared
            .cell
            .lock()
            .expect("rpc result cell poisoned") = Some(response);
        self.shared.notify.notify_waiters();
        true
    }

    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::SeqCst)
            && self
                .shared
                .cell
                .lock()
                .expect("rpc result cell poisoned")
                .is_some()
    }

    /// Awaits completion and clones the response out.
    pub async fn response(&self) -> RpcResponse {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(response) = self
                .shared
                .cell
                .lock()
                .expect("rpc result cell poisoned")
                .clone()
            {
                return response;
            }
            notified.await;
        }
    }
}
