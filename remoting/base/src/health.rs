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
    cmp::min,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    Notify,
};
use tracing::{debug, info, warn};

use crate::client::RemotingClient;

#[derive(Debug)]
pub enum HealthEvent {
    Unhealthy { address: String },
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Reconnect backoff grows linearly, attempt number times this delay.
    pub reconnect_base_delay: Duration,
    /// Backoff cap.
    pub reconnect_max_delay: Duration,
    /// A reconnect attempt stuck longer than this is forced to fail and
    /// retried.
    pub reconnect_attempt_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(3),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(10),
            reconnect_attempt_timeout: Duration::from_secs(5),
        }
    }
}

/// Process-wide health registry shared by every remoting client.
///
/// One scheduler heartbeats every healthy client and drives reconnection
/// for the unhealthy ones, instead of a timer per connection. The manager
/// is explicitly constructed and owned by whoever bootstraps the runtime;
/// there is no static instance.
pub struct HealthManager {
    config: HealthConfig,
    healthy: DashMap<String, Arc<RemotingClient>>,
    unhealthy: DashMap<String, Arc<RemotingClient>>,
    events_tx: UnboundedSender<HealthEvent>,
    stopped: AtomicBool,
    stop: Notify,
}

impl HealthManager {
    pub fn new(config: HealthConfig) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(HealthManager {
            config,
            healthy: DashMap::new(),
            unhealthy: DashMap::new(),
            events_tx,
            stopped: AtomicBool::new(false),
            stop: Notify::new(),
        });
        manager.clone().spawn_event_loop(events_rx);
        manager.clone().spawn_heartbeat_loop();
        manager
    }

    /// Sender that clients report connectivity failures through.
    pub fn event_sender(&self) -> UnboundedSender<HealthEvent> {
        self.events_tx.clone()
    }

    /// Starts health-tracking a connected client.
    pub fn watch(&self, client: Arc<RemotingClient>) {
        self.healthy.insert(client.address(), client);
    }

    pub fn unwatch(&self, address: &str) {
        self.healthy.remove(address);
        self.unhealthy.remove(address);
    }

    pub fn is_healthy(&self, address: &str) -> bool {
        self.healthy.contains_key(address)
    }

    pub fn healthy_count(&self) -> usize {
        self.healthy.len()
    }

    pub fn unhealthy_count(&self) -> usize {
        self.unhealthy.len()
    }

    pub fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop.notify_waiters();
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn spawn_event_loop(self: Arc<Self>, mut events_rx: UnboundedReceiver<HealthEvent>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.stop.notified() => break,
                    event = events_rx.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            HealthEvent::Unhealthy { address } => self.on_unhealthy(address),
                        }
                    }
                }
            }
        });
    }

    fn spawn_heartbeat_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = self.stop.notified() => break,
                    _ = ticker.tick() => self.heartbeat_all(),
                }
            }
        });
    }

    fn heartbeat_all(self: &Arc<Self>) {
        let timeout = self.config.heartbeat_timeout;
        for entry in self.healthy.iter() {
            let client = entry.value().clone();
            let manager = self.clone();
            tokio::spawn(async move {
                // an unresolved heartbeat fails by timeout inside the
                // client, which walks the same unhealthy path as any
                // request failure
                if let Err(err) = client.heartbeat(timeout).await {
                    debug!("heartbeat to {} failed: {}", client.address(), err);
                    // a terminated client never recovers; stop tracking it
                    if client.is_terminated() {
                        manager.unwatch(&client.address());
                    }
                }
            });
        }
    }

    fn on_unhealthy(self: &Arc<Self>, address: String) {
        let Some((_, client)) = self.healthy.remove(&address) else {
            // already reconnecting, or no longer watched
            return;
        };
        warn!("client {} marked unhealthy, scheduling reconnect", address);
        self.unhealthy.insert(address, client.clone());
        self.spawn_reconnect(client);
    }

    fn spawn_reconnect(self: &Arc<Self>, client: Arc<RemotingClient>) {
        // single-flight per client: a concurrent trigger joins the running
        // attempt instead of stacking a second one
        if client.begin_reconnect().is_none() {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            manager.reconnect_loop(&client).await;
            client.finish_reconnect();
        });
    }

    async fn reconnect_loop(&self, client: &Arc<RemotingClient>) {
        let address = client.address();
        let mut attempt: u32 = 0;
        loop {
            if self.is_stopped() || client.is_terminated() {
                self.unhealthy.remove(&address);
                return;
            }
            attempt += 1;
            let delay = min(
                self.config.reconnect_base_delay.saturating_mul(attempt),
                self.config.reconnect_max_delay,
            );
            tokio::time::sleep(delay).await;

            match tokio::time::timeout(self.config.reconnect_attempt_timeout, client.reconnect())
                .await
            {
                Ok(Ok(())) => {
                    info!("client {} reconnected after {} attempt(s)", address, attempt);
                    self.unhealthy.remove(&address);
                    self.healthy.insert(address, client.clone());
                    return;
                }
                Ok(Err(err)) => {
                    warn!(
                        "reconnect attempt {} to {} failed: {}",
                        attempt, address, err
                    );
                }
                Err(_) => {
                    warn!("reconnect attempt {} to {} timed out", attempt, address);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{HealthConfig, HealthEvent, HealthManager};
    use crate::{
        client::RemotingClient,
        command::{RemotingCommand, RemotingResponse},
        error::RemotingError,
        transport::{Channel, Transport, TransportHandler},
    };
    use spire_base::Url;

    /// Transport whose channels ack heartbeats only while `ack_heartbeats`
    /// is set, and whose next `fail_connects` connection attempts fail.
    #[derive(Default)]
    struct HeartbeatTransport {
        ack_heartbeats: Arc<AtomicBool>,
        connects: AtomicUsize,
        fail_connects: AtomicUsize,
    }

    struct HeartbeatChannel {
        handler: Arc<dyn TransportHandler>,
        ack_heartbeats: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Channel for HeartbeatChannel {
        async fn send(&self, command: RemotingCommand) -> Result<(), RemotingError> {
            if command.is_heartbeat() && self.ack_heartbeats.load(Ordering::SeqCst) {
                self.handler
                    .on_response(RemotingResponse::heartbeat_ack(command.id));
            }
            Ok(())
        }

        async fn close(&self) {}
    }

    #[async_trait]
    impl Transport for HeartbeatTransport {
        async fn connect(
            &self,
            url: &Url,
            handler: Arc<dyn TransportHandler>,
        ) -> Result<Box<dyn Channel>, RemotingError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connects.load(Ordering::SeqCst) > 0 {
                self.fail_connects.fetch_sub(1, Ordering::SeqCst);
                return Err(RemotingError::ConnectFailed(
                    url.address(),
                    "refused".to_string(),
                ));
            }
            Ok(Box::new(HeartbeatChannel {
                handler,
                ack_heartbeats: self.ack_heartbeats.clone(),
            }))
        }
    }

    fn fast_config() -> HealthConfig {
        HealthConfig {
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(20),
            reconnect_base_delay: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_millis(50),
            reconnect_attempt_timeout: Duration::from_millis(500),
        }
    }

    async fn wait_until<F: Fn() -> bool>(deadline: Duration, cond: F) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_heartbeat_timeout_triggers_reconnect_until_recovery() {
        spire_logger::init();
        let manager = HealthManager::new(fast_config());
        let transport = Arc::new(HeartbeatTransport::default());

        let url = Url::from_url("spire://127.0.0.1:9100/x").unwrap();
        let client = RemotingClient::new(url, transport.clone(), manager.event_sender());
        client.connect().await.unwrap();
        transport.fail_connects.store(2, Ordering::SeqCst);
        manager.watch(client.clone());
        assert_eq!(manager.healthy_count(), 1);

        // heartbeats are never acked, so the first round times out
        assert!(
            wait_until(Duration::from_secs(2), || manager.unhealthy_count() == 1).await,
            "client never became unhealthy"
        );

        // let the recovered connection's heartbeats succeed
        transport.ack_heartbeats.store(true, Ordering::SeqCst);

        assert!(
            wait_until(Duration::from_secs(2), || manager
                .is_healthy("127.0.0.1:9100"))
            .await,
            "client never recovered"
        );
        // initial connect + 2 failed attempts + 1 successful attempt
        assert!(transport.connects.load(Ordering::SeqCst) >= 4);
        assert!(client.is_available());
        assert!(!client.reconnect_in_progress());

        manager.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_duplicate_unhealthy_events_start_one_reconnect() {
        let manager = HealthManager::new(fast_config());
        let transport = Arc::new(HeartbeatTransport::default());
        transport.ack_heartbeats.store(true, Ordering::SeqCst);

        let url = Url::from_url("spire://127.0.0.1:9101/x").unwrap();
        let client = RemotingClient::new(url, transport.clone(), manager.event_sender());
        client.connect().await.unwrap();
        transport.fail_connects.store(1, Ordering::SeqCst);
        manager.watch(client.clone());

        let sender = manager.event_sender();
        sender
            .send(HealthEvent::Unhealthy {
                address: client.address(),
            })
            .unwrap();
        sender
            .send(HealthEvent::Unhealthy {
                address: client.address(),
            })
            .unwrap();

        // the client stays in the healthy set until the event loop has
        // processed the events; wait for the transition before watching
        // for recovery
        assert!(
            wait_until(Duration::from_secs(2), || manager.unhealthy_count() == 1).await,
            "client never became unhealthy"
        );
        assert!(
            wait_until(Duration::from_secs(2), || manager
                .is_healthy("127.0.0.1:9101"))
            .await,
            "client never recovered"
        );
        // initial connect + 1 failed attempt + 1 success; a second loop
        // would have produced more
        assert_eq!(transport.connects.load(Ordering::SeqCst), 3);

        manager.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_terminated_client_is_dropped_from_tracking() {
        let manager = HealthManager::new(fast_config());
        let transport = Arc::new(HeartbeatTransport::default());
        transport.ack_heartbeats.store(true, Ordering::SeqCst);

        let url = Url::from_url("spire://127.0.0.1:9103/x").unwrap();
        let client = RemotingClient::new(url, transport, manager.event_sender());
        client.connect().await.unwrap();
        manager.watch(client.clone());
        assert!(manager.is_healthy("127.0.0.1:9103"));

        // termination behind the manager's back, eg. the invoker pool
        // hung up; the next heartbeat round must clear the entry
        client.shutdown().await;
        assert!(
            wait_until(Duration::from_secs(2), || manager.healthy_count() == 0).await,
            "terminated client kept its healthy entry"
        );
        assert_eq!(manager.unhealthy_count(), 0);

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_unwatch_forgets_client() {
        let manager = HealthManager::new(fast_config());
        let transport = Arc::new(HeartbeatTransport::default());
        transport.ack_heartbeats.store(true, Ordering::SeqCst);

        let url = Url::from_url("spire://127.0.0.1:9102/x").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = RemotingClient::new(url, transport, tx);
        client.connect().await.unwrap();

        manager.watch(client.clone());
        assert!(manager.is_healthy("127.0.0.1:9102"));
        manager.unwatch("127.0.0.1:9102");
        assert!(!manager.is_healthy("127.0.0.1:9102"));
        assert_eq!(manager.unhealthy_count(), 0);

        manager.shutdown();
    }
}
