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
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use spire_base::Url;
use spire_remoting::{RemotingClient, RemotingCommand, RemotingError};
use tracing::debug;

use crate::{
    codec::Serializer,
    invocation::Invocation,
    invoker::Invoker,
    result::{RpcError, RpcResponse, RpcResult, Value},
};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(3000);

/// Takes a shared client back when one of its holders is destroyed. A
/// pooling factory counts holders and hangs up only after the last one.
#[async_trait]
pub trait ClientRelease: Send + Sync {
    async fn release(&self, client: &Arc<RemotingClient>);
}

/// Release for unpooled clients: the invoker owns the connection alone and
/// hangs it up directly.
struct ExclusiveRelease;

#[async_trait]
impl ClientRelease for ExclusiveRelease {
    async fn release(&self, client: &Arc<RemotingClient>) {
        client.shutdown().await;
    }
}

/// Leaf invoker bound to one remote connection for one service.
///
/// Serializes the invocation onto a remoting command, sends it through the
/// shared [`RemotingClient`] for the target address, and turns the wire
/// response (or failure) into a completed [`RpcResult`]. Identity is
/// `(address, service)`; directories diff invoker sets on it.
pub struct ReferenceInvoker {
    service_name: String,
    url: Url,
    client: Arc<RemotingClient>,
    serializer: Arc<dyn Serializer>,
    default_timeout: Duration,
    release: Arc<dyn ClientRelease>,
    destroyed: AtomicBool,
}

impl ReferenceInvoker {
    pub fn new(
        service_name: &str,
        url: Url,
        client: Arc<RemotingClient>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        ReferenceInvoker {
            service_name: service_name.to_string(),
            url,
            client,
            serializer,
            default_timeout: DEFAULT_CALL_TIMEOUT,
            release: Arc::new(ExclusiveRelease),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Routes teardown through `release` instead of hanging up directly.
    pub fn release_via(mut self, release: Arc<dyn ClientRelease>) -> Self {
        self.release = release;
        self
    }

    pub fn address(&self) -> String {
        self.url.address()
    }

    pub fn client(&self) -> &Arc<RemotingClient> {
        &self.client
    }

    fn build_command(&self, invocation: &Invocation) -> Result<RemotingCommand, RpcError> {
        let payload = self
            .serializer
            .serialize_args(invocation.args())
            .map_err(|err| RpcError::Serialization(err.to_string()))?;
        let mut command = RemotingCommand::request(
            invocation.service_name(),
            invocation.handler_name(),
            payload,
        );
        command.attachments = invocation.attachments();
        Ok(command)
    }

    fn map_remoting_error(&self, err: RemotingError) -> RpcError {
        match err {
            RemotingError::Unavailable(_) | RemotingError::Terminated(_) => {
                RpcError::Unavailable(self.service_name.clone())
            }
            other => RpcError::Transport(other.to_string()),
        }
    }

    async fn call(&self, invocation: &Invocation) -> RpcResponse {
        let command = match self.build_command(invocation) {
            Ok(command) => command,
            Err(err) => return RpcResponse::error(err),
        };

        if invocation.is_one_way() {
            // accepted by the transport is all a one-way caller gets
            return match self.client.fire_and_forget(command).await {
                Ok(()) => RpcResponse::empty(),
                Err(err) => RpcResponse::error(self.map_remoting_error(err)),
            };
        }

        let timeout = invocation.call_timeout().unwrap_or(self.default_timeout);
        let response = match self.client.request_response(command, timeout).await {
            Ok(response) => response,
            Err(err) => return RpcResponse::error(self.map_remoting_error(err)),
        };

        if !response.is_ok() {
            let message = response
                .error_message
                .unwrap_or_else(|| "unspecified server error".to_string());
            return RpcResponse::error(RpcError::Call(message));
        }

        if response.payload.is_empty() {
            return RpcResponse::ok(Value::Null);
        }
        match self.serializer.deserialize_value(&response.payload) {
            Ok(value) => RpcResponse::ok(value),
            Err(err) => RpcResponse::error(RpcError::Serialization(err.to_string())),
        }
    }
}

#[async_trait]
impl Invoker for ReferenceInvoker {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn url(&self) -> &Url {
        &self.url
    }

    async fn invoke(&self, invocation: Invocation) -> RpcResult {
        let response = self.call(&invocation).await;
        RpcResult::completed(response)
    }

    fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst) && self.client.is_available()
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(
            "destroying invoker {} -> {}",
            self.service_name,
            self.address()
        );
        self.release.release(&self.client).await;
    }
}

impl PartialEq for ReferenceInvoker {
    fn eq(&self, other: &Self) -> bool {
        self.service_name == other.service_name && self.url.address() == other.url.address()
    }
}

impl Eq for ReferenceInvoker {}

impl Hash for ReferenceInvoker {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.service_name.hash(state);
        self.url.address().hash(state);
    }
}
