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

use std::collections::HashMap;

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Request,
    Heartbeat,
}

/// One outbound command. The request id is stamped by the owning
/// [`RemotingClient`](crate::RemotingClient) just before the command is
/// handed to the transport.
///
/// The byte layout of the payload is the serializer's business; the
/// remoting layer only carries it.
#[derive(Debug, Clone)]
pub struct RemotingCommand {
    pub id: u64,
    pub kind: CommandKind,
    pub service_name: String,
    pub handler_name: String,
    pub payload: Bytes,
    pub attachments: HashMap<String, String>,
    pub one_way: bool,
}

impl RemotingCommand {
    pub fn request(service_name: &str, handler_name: &str, payload: Bytes) -> Self {
        RemotingCommand {
            id: 0,
            kind: CommandKind::Request,
            service_name: service_name.to_string(),
            handler_name: handler_name.to_string(),
            payload,
            attachments: HashMap::new(),
            one_way: false,
        }
    }

    pub fn heartbeat() -> Self {
        RemotingCommand {
            id: 0,
            kind: CommandKind::Heartbeat,
            service_name: String::new(),
            handler_name: String::new(),
            payload: Bytes::new(),
            attachments: HashMap::new(),
            one_way: false,
        }
    }

    pub fn one_way(mut self) -> Self {
        self.one_way = true;
        self
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.kind, CommandKind::Heartbeat)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    ServerError,
}

/// One inbound response, correlated to its request purely by id.
#[derive(Debug, Clone)]
pub struct RemotingResponse {
    pub id: u64,
    pub status: ResponseStatus,
    pub payload: Bytes,
    pub error_message: Option<String>,
}

impl RemotingResponse {
    pub fn ok(id: u64, payload: Bytes) -> Self {
        RemotingResponse {
            id,
            status: ResponseStatus::Ok,
            payload,
            error_message: None,
        }
    }

    pub fn server_error(id: u64, message: &str) -> Self {
        RemotingResponse {
            id,
            status: ResponseStatus::ServerError,
            payload: Bytes::new(),
            error_message: Some(message.to_string()),
        }
    }

    pub fn heartbeat_ack(id: u64) -> Self {
        Self::ok(id, Bytes::new())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, ResponseStatus::Ok)
    }
}
