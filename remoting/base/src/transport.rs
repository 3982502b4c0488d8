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

use std::sync::Arc;

use async_trait::async_trait;
use spire_base::Url;

use crate::{command::RemotingCommand, command::RemotingResponse, error::RemotingError};

/// The seam between transport-specific I/O and the client state machine.
///
/// A transport plugin turns a `host:port` into a connected [`Channel`] and
/// calls back into the [`TransportHandler`] it was given whenever a response
/// arrives or the connection drops. Everything else (correlation, health,
/// reconnection) lives on this side of the seam.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        url: &Url,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Box<dyn Channel>, RemotingError>;
}

#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, command: RemotingCommand) -> Result<(), RemotingError>;

    async fn close(&self);
}

/// Callbacks a transport must invoke from its I/O side. Implementations
/// must hand off quickly; the transport's I/O threads are not allowed to
/// stall on application work.
pub trait TransportHandler: Send + Sync {
    fn on_response(&self, response: RemotingResponse);

    fn on_connection_closed(&self);
}
