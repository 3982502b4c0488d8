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
    fmt::{Display, Formatter},
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::sync::{mpsc::UnboundedSender, oneshot, Notify};
use tracing::{debug, info, warn};

use crate::{
    command::{RemotingCommand, RemotingResponse},
    error::RemotingError,
    health::HealthEvent,
    transport::{Channel, Transport, TransportHandler},
};

use spire_base::Url;

/// Connection lifecycle. `Terminated` is terminal; everything in between
/// oscillates between available and unavailable as the connection fails and
/// recovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Init = 0,
    Connecting = 1,
    Available = 2,
    ConnectFailed = 3,
    Unavailable = 4,
    Reconnecting = 5,
    Terminated = 6,
}

impl ClientState {
    fn from_u8(v: u8) -> ClientState {
        match v {
            0 => ClientState::Init,
            1 => ClientState::Connecting,
            2 => ClientState::Available,
            3 => ClientState::ConnectFailed,
            4 => ClientState::Unavailable,
            5 => ClientState::Reconnecting,
            _ => ClientState::Terminated,
        }
    }
}

type PendingSender = oneshot::Sender<Result<RemotingResponse, RemotingError>>;

/// One logical connection to one remote address.
///
/// Concurrent in-flight requests are correlated back to their futures by
/// request id. Failures whose [`RemotingError::marks_unhealthy`] is true
/// flip the client to unavailable and report it to the
/// [`HealthManager`](crate::HealthManager), which owns reconnection.
pub struct RemotingClient {
    url: Url,
    transport: Arc<dyn Transport>,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    in_flight: DashMap<u64, PendingSender>,
    state: AtomicU8,
    id_seq: AtomicU64,
    // single-flight guard: non-None means a reconnect attempt is running
    reconnect_signal: Mutex<Option<Arc<Notify>>>,
    events: UnboundedSender<HealthEvent>,
}

struct ClientHandler {
    client: Weak<RemotingClient>,
}

impl TransportHandler for ClientHandler {
    fn on_response(&self, response: RemotingResponse) {
        if let Some(client) = self.client.upgrade() {
            client.handle_response(response);
        }
    }

    fn on_connection_closed(&self) {
        if let Some(client) = self.client.upgrade() {
            client.handle_connection_closed();
        }
    }
}

impl RemotingClient {
    pub fn new(
        url: Url,
        transport: Arc<dyn Transport>,
        events: UnboundedSender<HealthEvent>,
    ) -> Arc<Self> {
        Arc::new(RemotingClient {
            url,
            transport,
            channel: Mutex::new(None),
            in_flight: DashMap::new(),
            state: AtomicU8::new(ClientState::Init as u8),
            id_seq: AtomicU64::new(1),
            reconnect_signal: Mutex::new(None),
            events,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn address(&self) -> String {
        self.url.address()
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Transition helper; returns false when the current state was not
    /// `from` (another path got there first).
    fn transition(&self, from: ClientState, to: ClientState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_available(&self) -> bool {
        self.state() == ClientState::Available
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ClientState::Terminated
    }

    /// First connection. Resolves only once the attempt has succeeded or
    /// failed, so callers observe connectivity before proceeding. Later
    /// reconnects run in the background and never block callers.
    pub async fn connect(self: &Arc<Self>) -> Result<(), RemotingError> {
        if self.is_terminated() {
            return Err(RemotingError::Terminated(self.address()));
        }
        self.set_state(ClientState::Connecting);
        match self.establish().await {
            Ok(()) => {
                info!("connected to {}", self.address());
                Ok(())
            }
            Err(err) => {
                self.set_state(ClientState::ConnectFailed);
                Err(err)
            }
        }
    }

    /// One reconnect attempt, driven by the health manager's retry loop.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), RemotingError> {
        if self.is_terminated() {
            return Err(RemotingError::Terminated(self.address()));
        }
        self.set_state(ClientState::Reconnecting);
        match self.establish().await {
            Ok(()) => {
                info!("reconnected to {}", self.address());
                Ok(())
            }
            Err(err) => {
                self.set_state(ClientState::Unavailable);
                Err(err)
            }
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<(), RemotingError> {
        let handler = Arc::new(ClientHandler {
            client: Arc::downgrade(self),
        });
        let channel = self.transport.connect(&self.url, handler).await?;
        *self.channel.lock().expect("channel lock poisoned") = Some(Arc::from(channel));
        self.set_state(ClientState::Available);
        Ok(())
    }

    fn current_channel(&self) -> Result<Arc<dyn Channel>, RemotingError> {
        self.channel
            .lock()
            .expect("channel lock poisoned")
            .clone()
            .ok_or_else(|| RemotingError::Unavailable(self.address()))
    }

    fn next_id(&self) -> u64 {
        self.id_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends a command and awaits its correlated response.
    pub async fn request_response(
        &self,
        mut command: RemotingCommand,
        timeout: Duration,
    ) -> Result<RemotingResponse, RemotingError> {
        if self.is_terminated() {
            return Err(RemotingError::Terminated(self.address()));
        }
        if !self.is_available() {
            return Err(RemotingError::Unavailable(self.address()));
        }

        command.id = self.next_id();
        let id = command.id;

        let (tx, rx) = oneshot::channel();
        if self.in_flight.insert(id, tx).is_some() {
            // a request id can never be reused while still pending
            panic!("duplicate request id {} on client {}", id, self.address());
        }

        let channel = match self.current_channel() {
            Ok(channel) => channel,
            Err(err) => {
                self.in_flight.remove(&id);
                return Err(err);
            }
        };

        if let Err(err) = channel.send(command).await {
            self.in_flight.remove(&id);
            self.on_request_fail(&err);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RemotingError::Terminated(self.address())),
            Err(_) => {
                self.in_flight.remove(&id);
                let err = RemotingError::Timeout(timeout);
                self.on_request_fail(&err);
                Err(err)
            }
        }
    }

    /// One-way send; no correlation entry is registered.
    pub async fn fire_and_forget(&self, mut command: RemotingCommand) -> Result<(), RemotingError> {
        if self.is_terminated() {
            return Err(RemotingError::Terminated(self.address()));
        }
        if !self.is_available() {
            return Err(RemotingError::Unavailable(self.address()));
        }
        command.id = self.next_id();
        command.one_way = true;
        let channel = self.current_channel()?;
        if let Err(err) = channel.send(command).await {
            self.on_request_fail(&err);
            return Err(err);
        }
        Ok(())
    }

    pub async fn heartbeat(&self, timeout: Duration) -> Result<(), RemotingError> {
        self.request_response(RemotingCommand::heartbeat(), timeout)
            .await
            .map(|_| ())
    }

    /// Classifies a request failure; connectivity errors flip the client to
    /// unavailable and wake the health manager. Codec/protocol errors leave
    /// the connection alone.
    pub fn on_request_fail(&self, err: &RemotingError) {
        if !err.marks_unhealthy() {
            return;
        }
        self.mark_unavailable();
    }

    fn mark_unavailable(&self) {
        if self.transition(ClientState::Available, ClientState::Unavailable) {
            warn!("client {} became unavailable", self.address());
            let _ = self.events.send(HealthEvent::Unhealthy {
                address: self.address(),
            });
        }
    }

    fn handle_response(&self, response: RemotingResponse) {
        match self.in_flight.remove(&response.id) {
            Some((_, tx)) => {
                let _ = tx.send(Ok(response));
            }
            None => {
                // a response arriving after its caller timed out
                debug!(
                    "dropping uncorrelated response {} from {}",
                    response.id,
                    self.address()
                );
            }
        }
    }

    fn handle_connection_closed(&self) {
        if self.is_terminated() {
            return;
        }
        self.fail_in_flight(|| RemotingError::ConnectionClosed(self.address()));
        self.mark_unavailable();
    }

    /// Terminal shutdown; idempotent. Every still-pending request fails
    /// with `Terminated` so no caller is silently dropped.
    pub async fn shutdown(&self) {
        let previous = ClientState::from_u8(
            self.state
                .swap(ClientState::Terminated as u8, Ordering::SeqCst),
        );
        if previous == ClientState::Terminated {
            return;
        }
        info!("shutting down client {}", self.address());
        let channel = self.channel.lock().expect("channel lock poisoned").take();
        if let Some(channel) = channel {
            channel.close().await;
        }
        self.fail_in_flight(|| RemotingError::Terminated(self.address()));
    }

    fn fail_in_flight<F>(&self, err: F)
    where
        F: Fn() -> RemotingError,
    {
        let ids: Vec<u64> = self.in_flight.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.in_flight.remove(&id) {
                let _ = tx.send(Err(err()));
            }
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Claims the reconnect single-flight slot. Returns `None` when an
    /// attempt is already running; the second trigger is a no-op join.
    pub fn begin_reconnect(&self) -> Option<Arc<Notify>> {
        let mut guard = self
            .reconnect_signal
            .lock()
            .expect("reconnect signal lock poisoned");
        if guard.is_some() {
            return None;
        }
        let signal = Arc::new(Notify::new());
        *guard = Some(signal.clone());
        Some(signal)
    }

    pub fn finish_reconnect(&self) {
        let mut guard = self
            .reconnect_signal
            .lock()
            .expect("reconnect signal lock poisoned");
        if let Some(signal) = guard.take() {
            signal.notify_waiters();
        }
    }

    pub fn reconnect_in_progress(&self) -> bool {
        self.reconnect_signal
            .lock()
            .expect("reconnect signal lock poisoned")
            .is_some()
    }
}

impl Display for RemotingClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotingClient")
            .field("address", &self.address())
            .field("state", &self.state())
            .finish()
    }
}
