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

use std::time::Duration;

use thiserror::Error;

/// Transport-level failures.
///
/// The variants are partitioned into protocol-level errors (the bytes were
/// wrong, the connection is fine) and connectivity errors (the peer may be
/// down). Only the latter mark a client unhealthy; see
/// [`RemotingError::marks_unhealthy`].
#[derive(Error, Debug)]
pub enum RemotingError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("remoting protocol error: {0}")]
    Protocol(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("connection to {0} closed")]
    ConnectionClosed(String),

    #[error("failed to connect to {0}: {1}")]
    ConnectFailed(String, String),

    #[error("client for {0} is unavailable")]
    Unavailable(String),

    #[error("client for {0} has been terminated")]
    Terminated(String),
}

impl RemotingError {
    /// Whether this failure indicates the connection itself is suspect.
    ///
    /// Codec and protocol errors do not: tearing the connection down over a
    /// malformed payload would turn every application-level mistake into a
    /// reconnect storm. `Unavailable`/`Terminated` describe state the
    /// health machinery already knows about.
    pub fn marks_unhealthy(&self) -> bool {
        matches!(
            self,
            RemotingError::Timeout(_)
                | RemotingError::Io(_)
                | RemotingError::ConnectionClosed(_)
                | RemotingError::ConnectFailed(_, _)
        )
    }
}
