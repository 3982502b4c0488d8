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

//! Consumer-side assembly. [`SpireRuntime`] owns the shared transport,
//! serializer, health manager and registry subscription, and hands out
//! ready-to-call invoker chains for referenced services. All wiring is
//! explicit instance state; there are no process-wide singletons.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use spire_base::{ApplicationInstance, StdError, Url};
use spire_config::reference::ReferenceConfig;
use spire_remoting::{HealthConfig, HealthManager, RemotingClient, Transport};
use tracing::info;

use crate::{
    chain::FilterChainBuilder,
    codec::{JsonSerializer, Serializer},
    directory::{Directory, InvokerFactory},
    discovery::AppInstanceWatcher,
    filter::{CallLogFilter, ConsumerContextFilter, Filter},
    invocation::Invocation,
    invoker::Invoker,
    metadata::RemoteMetadataFetcher,
    reference::{ClientRelease, ReferenceInvoker},
    registry::{NotifyListener, Registry},
    result::{RpcError, RpcResult},
};

/// A pooled connection plus the number of invokers currently leasing it.
/// An entry in the pool always holds at least one lease; the decrement to
/// zero and the removal happen atomically under the map's shard lock.
struct PooledClient {
    client: Arc<RemotingClient>,
    leases: AtomicUsize,
}

/// Builds reference invokers over a shared per-address client pool. Two
/// services on the same remote address share one connection; the pool
/// counts leases and hangs up only when the last invoker is destroyed.
pub struct ClientInvokerFactory {
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn Serializer>,
    health: Arc<HealthManager>,
    clients: DashMap<String, Arc<PooledClient>>,
    me: Weak<ClientInvokerFactory>,
}

impl ClientInvokerFactory {
    pub fn new(
        transport: Arc<dyn Transport>,
        serializer: Arc<dyn Serializer>,
        health: Arc<HealthManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| ClientInvokerFactory {
            transport,
            serializer,
            health,
            clients: DashMap::new(),
            me: me.clone(),
        })
    }

    async fn lease_client(&self, url: &Url) -> Result<Arc<RemotingClient>, StdError> {
        let address = url.address();
        if let Some(pooled) = self.clients.get(&address) {
            // the map guard pins the entry, so a concurrent last-lease
            // release cannot remove it between the check and the take
            if !pooled.client.is_terminated() {
                pooled.leases.fetch_add(1, Ordering::SeqCst);
                return Ok(pooled.client.clone());
            }
        }

        let fresh = RemotingClient::new(
            url.clone(),
            self.transport.clone(),
            self.health.event_sender(),
        );
        fresh.connect().await?;

        // two concurrent creates may both have dialed; the loser hangs up
        let (client, loser) = match self.clients.entry(address) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().client.is_terminated() {
                    entry.insert(Arc::new(PooledClient {
                        client: fresh.clone(),
                        leases: AtomicUsize::new(1),
                    }));
                    (fresh, None)
                } else {
                    entry.get().leases.fetch_add(1, Ordering::SeqCst);
                    (entry.get().client.clone(), Some(fresh))
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(PooledClient {
                    client: fresh.clone(),
                    leases: AtomicUsize::new(1),
                }));
                (fresh, None)
            }
        };
        match loser {
            Some(duplicate) => duplicate.shutdown().await,
            None => self.health.watch(client.clone()),
        }
        Ok(client)
    }

    pub async fn shutdown_all(&self) {
        let addresses: Vec<String> = self
            .clients
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for address in addresses {
            if let Some((_, pooled)) = self.clients.remove(&address) {
                self.health.unwatch(&address);
                pooled.client.shutdown().await;
            }
        }
    }
}

#[async_trait]
impl ClientRelease for ClientInvokerFactory {
    async fn release(&self, client: &Arc<RemotingClient>) {
        let address = client.address();
        let last = self
            .clients
            .remove_if(&address, |_, pooled| {
                // decrementing to zero and removing are one step under the
                // shard lock, so a racing lease never lands on a dead entry
                Arc::ptr_eq(&pooled.client, client)
                    && pooled.leases.fetch_sub(1, Ordering::SeqCst) == 1
            })
            .is_some();
        if last {
            self.health.unwatch(&address);
            client.shutdown().await;
        }
    }
}

#[async_trait]
impl InvokerFactory for ClientInvokerFactory {
    async fn create(
        &self,
        service_name: &str,
        url: &Url,
    ) -> Result<Arc<dyn Invoker>, StdError> {
        let client = self.lease_client(url).await?;
        let mut invoker = ReferenceInvoker::new(
            service_name,
            url.clone(),
            client,
            self.serializer.clone(),
        );
        if let Some(factory) = self.me.upgrade() {
            invoker = invoker.release_via(factory);
        }
        Ok(Arc::new(invoker))
    }
}

/// Round-robins over the directory's currently usable invokers. With none
/// usable the call fails fast instead of queueing.
pub struct ClusterInvoker {
    service_name: String,
    directory: Arc<Directory>,
    cursor: AtomicUsize,
    default_timeout: Duration,
    url: Url,
}

impl ClusterInvoker {
    pub fn new(
        service_name: &str,
        directory: Arc<Directory>,
        default_timeout: Duration,
    ) -> Self {
        let mut url = Url::from_host_port("0.0.0.0", 0);
        url.service_name = service_name.to_string();
        ClusterInvoker {
            service_name: service_name.to_string(),
            directory,
            cursor: AtomicUsize::new(0),
            default_timeout,
            url,
        }
    }
}

#[async_trait]
impl Invoker for ClusterInvoker {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn url(&self) -> &Url {
        &self.url
    }

    async fn invoke(&self, mut invocation: Invocation) -> RpcResult {
        let candidates = self.directory.list();
        if candidates.is_empty() {
            return RpcResult::err(RpcError::Unavailable(self.service_name.clone()));
        }
        if invocation.call_timeout().is_none() {
            invocation = invocation.timeout(self.default_timeout);
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates[index].invoke(invocation).await
    }

    fn is_available(&self) -> bool {
        !self.directory.list().is_empty()
    }

    async fn destroy(&self) {
        self.directory.destroy().await;
    }
}

struct WatcherListener {
    watcher: Arc<AppInstanceWatcher>,
}

impl NotifyListener for WatcherListener {
    fn notify(&self, instances: Vec<ApplicationInstance>) {
        self.watcher.on_discovery(instances);
    }
}

/// One fully wired consumer runtime.
pub struct SpireRuntime {
    application: String,
    registry: Arc<dyn Registry>,
    health: Arc<HealthManager>,
    factory: Arc<ClientInvokerFactory>,
    // app name -> (watcher, the reference that opened the subscription)
    watchers: DashMap<String, (Arc<AppInstanceWatcher>, ReferenceConfig)>,
    stopped: AtomicBool,
}

impl SpireRuntime {
    pub fn new(
        application: &str,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn Registry>,
    ) -> Arc<Self> {
        Self::with_config(
            application,
            transport,
            registry,
            HealthConfig::default(),
            Arc::new(JsonSerializer),
        )
    }

    pub fn with_config(
        application: &str,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn Registry>,
        health_config: HealthConfig,
        serializer: Arc<dyn Serializer>,
    ) -> Arc<Self> {
        let health = HealthManager::new(health_config);
        let factory = ClientInvokerFactory::new(transport, serializer, health.clone());
        Arc::new(SpireRuntime {
            application: application.to_string(),
            registry,
            health,
            factory,
            watchers: DashMap::new(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn invoker_factory(&self) -> Arc<dyn InvokerFactory> {
        self.factory.clone()
    }

    pub fn health(&self) -> &Arc<HealthManager> {
        &self.health
    }

    async fn watcher_for(
        &self,
        config: &ReferenceConfig,
    ) -> Result<Arc<AppInstanceWatcher>, StdError> {
        if let Some(entry) = self.watchers.get(&config.app_name) {
            return Ok(entry.0.clone());
        }
        let fetcher = Arc::new(RemoteMetadataFetcher::new(self.invoker_factory()));
        let watcher = AppInstanceWatcher::new(&config.app_name, fetcher);
        self.watchers
            .insert(config.app_name.clone(), (watcher.clone(), config.clone()));
        self.registry
            .subscribe(
                config,
                Arc::new(WatcherListener {
                    watcher: watcher.clone(),
                }),
            )
            .await?;
        Ok(watcher)
    }

    /// References a remote service: subscribes to its hosting application,
    /// sets up a discovery-maintained directory, and wraps it in the
    /// standard filter chain.
    pub async fn reference(
        &self,
        config: &ReferenceConfig,
    ) -> Result<Arc<dyn Invoker>, StdError> {
        self.reference_with_filters(config, Vec::new()).await
    }

    pub async fn reference_with_filters(
        &self,
        config: &ReferenceConfig,
        filters: Vec<Arc<dyn Filter>>,
    ) -> Result<Arc<dyn Invoker>, StdError> {
        let watcher = self.watcher_for(config).await?;

        let directory = Directory::new(&config.interface, self.invoker_factory());
        let cluster = Arc::new(ClusterInvoker::new(
            &config.interface,
            directory.clone(),
            Duration::from_millis(config.timeout_ms),
        ));
        watcher.watch_service(&config.interface, directory).await;

        let mut builder = FilterChainBuilder::new()
            .internal_pre(Arc::new(ConsumerContextFilter::new(&self.application)));
        for filter in filters {
            builder = builder.filter(filter);
        }
        let chain = builder
            .internal_post(Arc::new(CallLogFilter))
            .build(cluster);
        Ok(Arc::new(chain))
    }

    /// Stops discovery, closes every pooled connection and halts the
    /// health loops. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down runtime {}", self.application);

        let apps: Vec<String> = self
            .watchers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for app in apps {
            if let Some((_, (watcher, subscription))) = self.watchers.remove(&app) {
                if let Err(err) = self.registry.unsubscribe(&subscription).await {
                    tracing::warn!("unsubscribe {} failed: {}", app, err);
                }
                watcher.destroy().await;
            }
        }

        self.factory.shutdown_all().await;
        self.health.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc, time::Duration};

    use async_trait::async_trait;
    use serde_json::json;
    use spire_base::{constants::METADATA_SERVICE_NAME, StdError, Url};
    use spire_config::{ReferenceConfig, ServiceConfig};
    use spire_remoting::{
        Channel, HealthConfig, HealthManager, RemotingCommand, RemotingError, Transport,
        TransportHandler,
    };

    use super::{ClientInvokerFactory, SpireRuntime};
    use crate::{
        codec::JsonSerializer,
        directory::InvokerFactory,
        invocation::Invocation,
        invoker::Invoker,
        registry::{MemoryRegistry, Registry},
        result::{RpcError, Value},
        service::{MethodHandler, MethodRegistry},
    };

    /// In-process transport: commands are dispatched straight into a
    /// provider-side method registry and answered on a spawned task.
    struct LoopbackTransport {
        methods: Arc<MethodRegistry>,
    }

    struct LoopbackChannel {
        methods: Arc<MethodRegistry>,
        handler: Arc<dyn TransportHandler>,
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn connect(
            &self,
            _url: &Url,
            handler: Arc<dyn TransportHandler>,
        ) -> Result<Box<dyn Channel>, RemotingError> {
            Ok(Box::new(LoopbackChannel {
                methods: self.methods.clone(),
                handler,
            }))
        }
    }

    #[async_trait]
    impl Channel for LoopbackChannel {
        async fn send(&self, command: RemotingCommand) -> Result<(), RemotingError> {
            let methods = self.methods.clone();
            let handler = self.handler.clone();
            let one_way = command.one_way;
            tokio::spawn(async move {
                let response = methods.dispatch(command, &JsonSerializer).await;
                if !one_way {
                    handler.on_response(response);
                }
            });
            Ok(())
        }

        async fn close(&self) {}
    }

    struct GreetHandler;

    #[async_trait]
    impl MethodHandler for GreetHandler {
        async fn call(
            &self,
            args: Vec<Value>,
            attachments: &HashMap<String, String>,
        ) -> Result<Value, StdError> {
            let name = args.first().and_then(Value::as_str).unwrap_or("nobody");
            let caller = attachments
                .get(crate::filter::CONSUMER_APP_ATTACHMENT)
                .cloned()
                .unwrap_or_default();
            Ok(json!(format!("hello {} from {}", name, caller)))
        }
    }

    struct MetadataHandler;

    #[async_trait]
    impl MethodHandler for MetadataHandler {
        async fn call(
            &self,
            _args: Vec<Value>,
            _attachments: &HashMap<String, String>,
        ) -> Result<Value, StdError> {
            Ok(json!({"services": {"org.demo.Greeter": {}}}))
        }
    }

    fn provider_methods() -> Arc<MethodRegistry> {
        let methods = Arc::new(MethodRegistry::new());
        methods
            .register(METADATA_SERVICE_NAME, "getMetadata", Arc::new(MetadataHandler))
            .unwrap();
        methods
            .register("org.demo.Greeter", "greet", Arc::new(GreetHandler))
            .unwrap();
        methods
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_end_to_end_call_through_runtime() {
        let registry = Arc::new(MemoryRegistry::new());
        let transport = Arc::new(LoopbackTransport {
            methods: provider_methods(),
        });
        let runtime = SpireRuntime::new("consumer-app", transport, registry.clone());

        registry
            .register(&ServiceConfig::new(
                "org.demo.Greeter",
                "provider-app",
                "10.0.0.1",
                9000,
            ))
            .await
            .unwrap();

        let config = ReferenceConfig::new("org.demo.Greeter").app_name("provider-app");
        let greeter = runtime.reference(&config).await.unwrap();
        wait_until(|| greeter.is_available()).await;

        let response = greeter
            .invoke(Invocation::new(
                "org.demo.Greeter",
                "greet",
                vec![json!("alice")],
            ))
            .await
            .response()
            .await;
        assert_eq!(
            response.into_result().unwrap(),
            json!("hello alice from consumer-app")
        );

        runtime.shutdown().await;
        runtime.shutdown().await;
        let response = greeter
            .invoke(Invocation::new("org.demo.Greeter", "greet", vec![]))
            .await
            .response()
            .await;
        assert_eq!(
            response.into_result().unwrap_err(),
            RpcError::Unavailable("org.demo.Greeter".into())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pooled_client_survives_sibling_invoker_destroy() {
        let transport = Arc::new(LoopbackTransport {
            methods: provider_methods(),
        });
        let health = HealthManager::new(HealthConfig::default());
        let factory =
            ClientInvokerFactory::new(transport, Arc::new(JsonSerializer), health.clone());

        let url = Url::from_url("spire://10.0.0.1:9000/org.demo.Greeter").unwrap();
        let greeter = factory.create("org.demo.Greeter", &url).await.unwrap();
        let metadata = factory.create(METADATA_SERVICE_NAME, &url).await.unwrap();

        // both invokers lease the same pooled connection
        metadata.destroy().await;
        assert!(greeter.is_available());
        assert!(health.is_healthy("10.0.0.1:9000"));

        let response = greeter
            .invoke(Invocation::new(
                "org.demo.Greeter",
                "greet",
                vec![json!("carol")],
            ))
            .await
            .response()
            .await;
        assert!(response.is_ok());

        // the last lease going away hangs the connection up for real
        greeter.destroy().await;
        assert!(!greeter.is_available());
        assert!(!health.is_healthy("10.0.0.1:9000"));
        assert_eq!(health.healthy_count(), 0);

        health.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_handler_surfaces_as_call_error() {
        let registry = Arc::new(MemoryRegistry::new());
        let transport = Arc::new(LoopbackTransport {
            methods: provider_methods(),
        });
        let runtime = SpireRuntime::new("consumer-app", transport, registry.clone());

        registry
            .register(&ServiceConfig::new(
                "org.demo.Greeter",
                "provider-app",
                "10.0.0.1",
                9000,
            ))
            .await
            .unwrap();
        let config = ReferenceConfig::new("org.demo.Greeter").app_name("provider-app");
        let greeter = runtime.reference(&config).await.unwrap();
        wait_until(|| greeter.is_available()).await;

        let response = greeter
            .invoke(Invocation::new("org.demo.Greeter", "no_such", vec![]))
            .await
            .response()
            .await;
        match response.into_result().unwrap_err() {
            RpcError::Call(message) => assert!(message.contains("unknown handler")),
            other => panic!("unexpected error {:?}", other),
        }

        runtime.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_membership_change_converges() {
        let registry = Arc::new(MemoryRegistry::new());
        let transport = Arc::new(LoopbackTransport {
            methods: provider_methods(),
        });
        let runtime = SpireRuntime::new("consumer-app", transport, registry.clone());

        let first = ServiceConfig::new("org.demo.Greeter", "provider-app", "10.0.0.1", 9000);
        let second = ServiceConfig::new("org.demo.Greeter", "provider-app", "10.0.0.2", 9000);
        registry.register(&first).await.unwrap();

        let config = ReferenceConfig::new("org.demo.Greeter").app_name("provider-app");
        let greeter = runtime.reference(&config).await.unwrap();
        wait_until(|| greeter.is_available()).await;

        // rolling restart: the replacement joins before the original leaves
        registry.register(&second).await.unwrap();
        registry.unregister(&first).await.unwrap();

        // once membership settles, calls succeed consistently again
        wait_until(|| greeter.is_available()).await;
        let mut consecutive = 0;
        for _ in 0..200 {
            let response = greeter
                .invoke(Invocation::new(
                    "org.demo.Greeter",
                    "greet",
                    vec![json!("bob")],
                ))
                .await
                .response()
                .await;
            if response.is_ok() {
                consecutive += 1;
                if consecutive >= 4 {
                    break;
                }
            } else {
                consecutive = 0;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(consecutive >= 4, "calls never settled after membership change");

        runtime.shutdown().await;
    }
}
