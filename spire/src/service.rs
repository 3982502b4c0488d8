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

//! Provider-side dispatch. Handlers are registered explicitly under
//! `service/handler` keys; there is no reflective scan of exported types.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use spire_base::StdError;
use spire_remoting::{RemotingCommand, RemotingResponse};
use thiserror::Error;
use tracing::warn;

use crate::{codec::Serializer, result::Value};

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("handler already registered for {0}")]
    Duplicate(String),
}

/// One callable method exposed by a provider.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn call(
        &self,
        args: Vec<Value>,
        attachments: &HashMap<String, String>,
    ) -> Result<Value, StdError>;
}

/// Routing table from `service/handler` keys to handlers.
///
/// Registration is explicit and double registration is an error; silently
/// replacing a live handler would reroute in-flight traffic.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: DashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        service_name: &str,
        handler_name: &str,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<(), RegistrationError> {
        let key = format!("{}/{}", service_name, handler_name);
        match self.handlers.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistrationError::Duplicate(key))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(handler);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, service_name: &str, handler_name: &str) -> bool {
        self.handlers
            .remove(&format!("{}/{}", service_name, handler_name))
            .is_some()
    }

    pub fn contains(&self, service_name: &str, handler_name: &str) -> bool {
        self.handlers
            .contains_key(&format!("{}/{}", service_name, handler_name))
    }

    /// Executes one inbound command against the registered handler and
    /// renders the outcome as a wire response. Handler and codec failures
    /// both surface as server errors carrying the message.
    pub async fn dispatch(
        &self,
        command: RemotingCommand,
        serializer: &dyn Serializer,
    ) -> RemotingResponse {
        if command.is_heartbeat() {
            return RemotingResponse::heartbeat_ack(command.id);
        }

        let key = format!("{}/{}", command.service_name, command.handler_name);
        let handler = match self.handlers.get(&key) {
            Some(entry) => entry.value().clone(),
            None => {
                warn!("no handler registered for {}", key);
                return RemotingResponse::server_error(
                    command.id,
                    &format!("unknown handler {}", key),
                );
            }
        };

        let args = match serializer.deserialize_args(&command.payload) {
            Ok(args) => args,
            Err(err) => {
                return RemotingResponse::server_error(
                    command.id,
                    &format!("malformed request payload: {}", err),
                )
            }
        };

        match handler.call(args, &command.attachments).await {
            Ok(value) => match serializer.serialize_value(&value) {
                Ok(payload) => RemotingResponse::ok(command.id, payload),
                Err(err) => RemotingResponse::server_error(
                    command.id,
                    &format!("response serialization failed: {}", err),
                ),
            },
            Err(err) => RemotingResponse::server_error(command.id, &err.to_string()),
        }
    }
}
