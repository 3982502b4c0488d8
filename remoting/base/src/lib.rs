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

//! Wire-agnostic remoting layer: the command/response exchange model, the
//! [`Transport`] seam a transport plugin implements, the per-connection
//! [`RemotingClient`] state machine with request correlation, and the
//! process-wide [`HealthManager`] that heartbeats healthy clients and
//! drives reconnection for unhealthy ones.

pub mod client;
pub mod command;
pub mod error;
pub mod health;
pub mod transport;

pub use client::{ClientState, RemotingClient};
pub use command::{CommandKind, RemotingCommand, RemotingResponse, ResponseStatus};
pub use error::RemotingError;
pub use health::{HealthConfig, HealthManager};
pub use transport::{Channel, Transport, TransportHandler};
