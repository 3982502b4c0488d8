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

//! Application-instance discovery. Registry snapshots arrive on
//! [`AppInstanceWatcher::on_discovery`]; the watcher diffs them per group,
//! pulls metadata from newly seen instances, and pushes the resulting
//! per-service address lists into the registered [`Directory`]s.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::future::join_all;
use spire_base::{AppMetadata, ApplicationInstance, ServiceInstance, Url};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use crate::{directory::Directory, invoker::Invoker, metadata::MetadataFetcher};

/// One instance the watcher currently tracks, together with the metadata
/// it reported and the invoker used to fetch it.
pub struct AppInstanceContext {
    pub instance: ApplicationInstance,
    pub metadata: AppMetadata,
    pub invoker: Arc<dyn Invoker>,
}

#[derive(Clone)]
pub struct WatcherConfig {
    /// Upper bound on snapshots one worker activation drains before
    /// releasing the processing slot.
    pub max_drain: usize,
    pub fetch_timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            max_drain: 5,
            fetch_timeout: Duration::from_millis(3000),
        }
    }
}

/// A directory plus the queue feeding its dedicated refresh worker.
/// Dropping the sender ends the worker.
struct WatchedDirectory {
    directory: Arc<Directory>,
    refresh_tx: UnboundedSender<Vec<Url>>,
}

/// Turns raw instance snapshots into directory updates.
///
/// Snapshots coalesce: a burst of notifications leaves only the newest in
/// the pending slot, and a single worker (guarded by `processing`) drains
/// it. Intermediate snapshots overwritten before the worker gets to them
/// are never processed; only the latest state matters. Directory refreshes
/// are queued to one worker per service, so a slow refresh stalls neither
/// snapshot processing nor the other services.
pub struct AppInstanceWatcher {
    app_name: String,
    fetcher: Arc<dyn MetadataFetcher>,
    config: WatcherConfig,
    pending: Mutex<Option<Vec<ApplicationInstance>>>,
    processing: AtomicBool,
    // group -> tracked instances; one lock serializes diff passes
    contexts: tokio::sync::Mutex<HashMap<String, Vec<Arc<AppInstanceContext>>>>,
    directories: DashMap<String, WatchedDirectory>,
    destroyed: AtomicBool,
}

impl AppInstanceWatcher {
    pub fn new(app_name: &str, fetcher: Arc<dyn MetadataFetcher>) -> Arc<Self> {
        Self::with_config(app_name, fetcher, WatcherConfig::default())
    }

    pub fn with_config(
        app_name: &str,
        fetcher: Arc<dyn MetadataFetcher>,
        config: WatcherConfig,
    ) -> Arc<Self> {
        Arc::new(AppInstanceWatcher {
            app_name: app_name.to_string(),
            fetcher,
            config,
            pending: Mutex::new(None),
            processing: AtomicBool::new(false),
            contexts: tokio::sync::Mutex::new(HashMap::new()),
            directories: DashMap::new(),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Registers the directory to be refreshed whenever the set of
    /// instances hosting `service_name` changes, seeding it from the
    /// instances already tracked so a late subscriber does not wait for
    /// the next registry notification.
    pub async fn watch_service(&self, service_name: &str, directory: Arc<Directory>) {
        let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel::<Vec<Url>>();
        let worker = directory.clone();
        tokio::spawn(async move {
            while let Some(urls) = refresh_rx.recv().await {
                worker.refresh(urls).await;
            }
        });

        // registration and seeding happen under the contexts lock so a
        // concurrent snapshot pass cannot slip a newer refresh in between
        let contexts = self.contexts.lock().await;
        let _ = refresh_tx.send(Self::urls_for(service_name, &contexts));
        self.directories.insert(
            service_name.to_string(),
            WatchedDirectory {
                directory,
                refresh_tx,
            },
        );
    }

    pub fn unwatch_service(&self, service_name: &str) -> Option<Arc<Directory>> {
        self.directories
            .remove(service_name)
            .map(|(_, watched)| watched.directory)
    }

    /// Accepts a full-state snapshot from the registry. Never blocks the
    /// registry callback: the snapshot is parked in the latest-wins slot
    /// and a background worker picks it up.
    pub fn on_discovery(self: &Arc<Self>, instances: Vec<ApplicationInstance>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let replaced = self
            .pending
            .lock()
            .expect("pending snapshot lock poisoned")
            .replace(instances)
            .is_some();
        if replaced {
            debug!("watcher {} coalesced a stale snapshot", self.app_name);
        }
        self.try_schedule();
    }

    fn try_schedule(self: &Arc<Self>) {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let watcher = self.clone();
        tokio::spawn(async move {
            let mut drained = 0;
            while drained < watcher.config.max_drain {
                let snapshot = watcher
                    .pending
                    .lock()
                    .expect("pending snapshot lock poisoned")
                    .take();
                match snapshot {
                    Some(instances) => watcher.process(instances).await,
                    None => break,
                }
                drained += 1;
            }
            watcher.processing.store(false, Ordering::SeqCst);
            // a snapshot parked between the last take and the flag release
            // would otherwise wait for the next notification
            let still_pending = watcher
                .pending
                .lock()
                .expect("pending snapshot lock poisoned")
                .is_some();
            if still_pending {
                watcher.try_schedule();
            }
        });
    }

    async fn process(&self, instances: Vec<ApplicationInstance>) {
        let mut contexts = self.contexts.lock().await;
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let mut incoming: HashMap<String, Vec<ApplicationInstance>> = HashMap::new();
        for instance in instances {
            incoming
                .entry(instance.group.clone())
                .or_default()
                .push(instance);
        }
        // a group absent from the snapshot lost all its instances
        for group in contexts.keys() {
            incoming.entry(group.clone()).or_default();
        }

        let mut removed: Vec<Arc<AppInstanceContext>> = Vec::new();
        for (group, group_instances) in incoming {
            let existing = contexts.remove(&group).unwrap_or_default();

            let (kept, gone): (Vec<_>, Vec<_>) = existing
                .into_iter()
                .partition(|context| group_instances.contains(&context.instance));
            removed.extend(gone);

            let fresh: Vec<ApplicationInstance> = group_instances
                .into_iter()
                .filter(|instance| {
                    !kept.iter().any(|context| context.instance == *instance)
                })
                .collect();

            let mut next = kept;
            next.extend(self.fetch_all(fresh).await);
            if !next.is_empty() {
                contexts.insert(group, next);
            }
        }

        self.refresh_directories(&contexts);

        for context in removed {
            info!(
                "watcher {} released instance {}",
                self.app_name, context.instance
            );
            context.invoker.destroy().await;
        }
    }

    /// Metadata fetches for new instances run concurrently, each capped by
    /// the fetch timeout. A failed or slow instance is dropped from this
    /// pass; it is retried when a later snapshot still contains it.
    async fn fetch_all(
        &self,
        instances: Vec<ApplicationInstance>,
    ) -> Vec<Arc<AppInstanceContext>> {
        let fetches = instances.into_iter().map(|instance| async move {
            let fetched =
                tokio::time::timeout(self.config.fetch_timeout, self.fetcher.fetch(&instance))
                    .await;
            match fetched {
                Ok(Ok(fetched)) => Some(Arc::new(AppInstanceContext {
                    instance,
                    metadata: fetched.metadata,
                    invoker: fetched.invoker,
                })),
                Ok(Err(err)) => {
                    warn!(
                        "watcher {} metadata fetch from {} failed: {}",
                        self.app_name, instance, err
                    );
                    None
                }
                Err(_) => {
                    warn!(
                        "watcher {} metadata fetch from {} timed out",
                        self.app_name, instance
                    );
                    None
                }
            }
        });
        join_all(fetches).await.into_iter().flatten().collect()
    }

    fn urls_for(
        service_name: &str,
        contexts: &HashMap<String, Vec<Arc<AppInstanceContext>>>,
    ) -> Vec<Url> {
        contexts
            .values()
            .flatten()
            .filter(|context| context.metadata.services.contains_key(service_name))
            .map(|context| ServiceInstance::new(service_name, &context.instance).to_url())
            .collect()
    }

    /// Hands each watched service its fresh address list. Sends never
    /// block; each service's worker applies them in arrival order.
    fn refresh_directories(&self, contexts: &HashMap<String, Vec<Arc<AppInstanceContext>>>) {
        for entry in self.directories.iter() {
            let urls = Self::urls_for(entry.key(), contexts);
            if entry.value().refresh_tx.send(urls).is_err() {
                debug!("refresh worker for {} is gone", entry.key());
            }
        }
    }

    /// Terminal teardown; idempotent. Registered directories and tracked
    /// metadata invokers are all destroyed.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pending
            .lock()
            .expect("pending snapshot lock poisoned")
            .take();

        let mut contexts = self.contexts.lock().await;
        for (_, group) in contexts.drain() {
            for context in group {
                context.invoker.destroy().await;
            }
        }
        drop(contexts);

        let services: Vec<String> = self
            .directories
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for service in services {
            if let Some((_, watched)) = self.directories.remove(&service) {
                watched.directory.destroy().await;
            }
        }
        info!("watcher {} destroyed", self.app_name);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use spire_base::{AppMetadata, ApplicationInstance, StdError, Url};

    use super::{AppInstanceWatcher, WatcherConfig};
    use crate::{
        directory::{Directory, InvokerFactory},
        invocation::Invocation,
        invoker::Invoker,
        metadata::{FetchedMetadata, MetadataFetcher},
        result::RpcResult,
    };

    struct NullInvoker {
        url: Url,
        destroyed: AtomicBool,
    }

    #[async_trait]
    impl Invoker for NullInvoker {
        fn service_name(&self) -> &str {
            "null"
        }

        fn url(&self) -> &Url {
            &self.url
        }

        async fn invoke(&self, _invocation: Invocation) -> RpcResult {
            RpcResult::ok(serde_json::Value::Null)
        }

        async fn destroy(&self) {
            self.destroyed.store(true, Ordering::SeqCst);
        }
    }

    /// Fetcher returning a fixed service list per instance address.
    struct MapFetcher {
        services: HashMap<String, Vec<String>>,
        delay: Duration,
        fetched: Mutex<Vec<String>>,
        metadata_invokers: Mutex<Vec<Arc<NullInvoker>>>,
    }

    impl MapFetcher {
        fn new(services: HashMap<String, Vec<String>>) -> Self {
            MapFetcher {
                services,
                delay: Duration::ZERO,
                fetched: Mutex::new(Vec::new()),
                metadata_invokers: Mutex::new(Vec::new()),
            }
        }

        fn fetched_addresses(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MetadataFetcher for MapFetcher {
        async fn fetch(
            &self,
            instance: &ApplicationInstance,
        ) -> Result<FetchedMetadata, StdError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.fetched.lock().unwrap().push(instance.address());
            let names = self
                .services
                .get(&instance.address())
                .cloned()
                .unwrap_or_default();
            let invoker = Arc::new(NullInvoker {
                url: instance.to_url(),
                destroyed: AtomicBool::new(false),
            });
            self.metadata_invokers.lock().unwrap().push(invoker.clone());
            Ok(FetchedMetadata {
                metadata: AppMetadata {
                    services: names
                        .into_iter()
                        .map(|name| (name, HashMap::new()))
                        .collect(),
                },
                invoker,
            })
        }
    }

    #[derive(Default)]
    struct PassiveFactory {
        create_calls: AtomicUsize,
    }

    #[async_trait]
    impl InvokerFactory for PassiveFactory {
        async fn create(
            &self,
            _service_name: &str,
            url: &Url,
        ) -> Result<Arc<dyn Invoker>, StdError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullInvoker {
                url: url.clone(),
                destroyed: AtomicBool::new(false),
            }))
        }
    }

    fn instance(port: u16) -> ApplicationInstance {
        ApplicationInstance::new("demo-app", "10.0.0.1", port)
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

    fn directory_addresses(directory: &Directory) -> Vec<String> {
        let mut list: Vec<String> = directory
            .list()
            .iter()
            .map(|invoker| invoker.url().address())
            .collect();
        list.sort();
        list
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_snapshot_flows_into_directory() {
        let fetcher = Arc::new(MapFetcher::new(HashMap::from([
            ("10.0.0.1:9001".to_string(), vec!["org.demo.Greeter".to_string()]),
            ("10.0.0.1:9002".to_string(), vec!["org.demo.Greeter".to_string()]),
        ])));
        let watcher = AppInstanceWatcher::new("demo-app", fetcher.clone());
        let directory = Directory::new("org.demo.Greeter", Arc::new(PassiveFactory::default()));
        watcher
            .watch_service("org.demo.Greeter", directory.clone())
            .await;

        watcher.on_discovery(vec![instance(9001)]);
        wait_until(|| directory.list().len() == 1).await;
        assert_eq!(directory_addresses(&directory), vec!["10.0.0.1:9001"]);

        watcher.on_discovery(vec![instance(9001), instance(9002)]);
        wait_until(|| directory.list().len() == 2).await;

        // instance 9001 leaves; its metadata invoker is torn down
        watcher.on_discovery(vec![instance(9002)]);
        wait_until(|| directory.list().len() == 1).await;
        assert_eq!(directory_addresses(&directory), vec!["10.0.0.1:9002"]);
        wait_until(|| {
            fetcher
                .metadata_invokers
                .lock()
                .unwrap()
                .iter()
                .any(|invoker| {
                    invoker.url.address() == "10.0.0.1:9001"
                        && invoker.destroyed.load(Ordering::SeqCst)
                })
        })
        .await;

        // surviving instance was fetched exactly once across three snapshots
        let fetches = fetcher.fetched_addresses();
        assert_eq!(
            fetches
                .iter()
                .filter(|address| *address == "10.0.0.1:9002")
                .count(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unwatched_directory_stops_refreshing() {
        let fetcher = Arc::new(MapFetcher::new(HashMap::from([(
            "10.0.0.1:9001".to_string(),
            vec!["org.demo.Greeter".to_string()],
        )])));
        let watcher = AppInstanceWatcher::new("demo-app", fetcher.clone());
        let directory = Directory::new("org.demo.Greeter", Arc::new(PassiveFactory::default()));
        watcher
            .watch_service("org.demo.Greeter", directory.clone())
            .await;

        watcher.on_discovery(vec![instance(9001)]);
        wait_until(|| directory.list().len() == 1).await;

        let removed = watcher.unwatch_service("org.demo.Greeter").unwrap();
        assert!(Arc::ptr_eq(&removed, &directory));
        assert!(watcher.unwatch_service("org.demo.Greeter").is_none());

        // membership keeps changing but the removed directory stays put
        watcher.on_discovery(vec![]);
        wait_until(|| {
            fetcher.metadata_invokers.lock().unwrap()[0]
                .destroyed
                .load(Ordering::SeqCst)
        })
        .await;
        assert_eq!(directory.list().len(), 1);
    }

    /// Factory whose connect for one service never completes.
    struct HangOnSlowFactory;

    #[async_trait]
    impl InvokerFactory for HangOnSlowFactory {
        async fn create(
            &self,
            service_name: &str,
            url: &Url,
        ) -> Result<Arc<dyn Invoker>, StdError> {
            if service_name == "org.demo.Slow" {
                futures::future::pending::<()>().await;
            }
            Ok(Arc::new(NullInvoker {
                url: url.clone(),
                destroyed: AtomicBool::new(false),
            }))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stalled_refresh_does_not_block_other_services() {
        let fetcher = Arc::new(MapFetcher::new(HashMap::from([(
            "10.0.0.1:9001".to_string(),
            vec!["org.demo.Slow".to_string(), "org.demo.Fast".to_string()],
        )])));
        let watcher = AppInstanceWatcher::new("demo-app", fetcher.clone());
        let factory = Arc::new(HangOnSlowFactory);
        let slow = Directory::new("org.demo.Slow", factory.clone());
        let fast = Directory::new("org.demo.Fast", factory);
        watcher.watch_service("org.demo.Slow", slow.clone()).await;
        watcher.watch_service("org.demo.Fast", fast.clone()).await;

        watcher.on_discovery(vec![instance(9001)]);
        wait_until(|| fast.list().len() == 1).await;
        assert!(slow.list().is_empty());

        // the hung refresh must not stall the next snapshot either
        watcher.on_discovery(vec![]);
        wait_until(|| fast.list().is_empty()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_burst_coalesces_to_latest_snapshot() {
        let mut fetcher = MapFetcher::new(HashMap::from([
            ("10.0.0.1:9001".to_string(), vec!["org.demo.Greeter".to_string()]),
            ("10.0.0.1:9002".to_string(), vec!["org.demo.Greeter".to_string()]),
            ("10.0.0.1:9003".to_string(), vec!["org.demo.Greeter".to_string()]),
        ]));
        fetcher.delay = Duration::from_millis(50);
        let fetcher = Arc::new(fetcher);
        let watcher = AppInstanceWatcher::new("demo-app", fetcher.clone());
        let directory = Directory::new("org.demo.Greeter", Arc::new(PassiveFactory::default()));
        watcher
            .watch_service("org.demo.Greeter", directory.clone())
            .await;

        // three snapshots land while the first fetch is still sleeping;
        // the middle one must be overwritten before it is ever processed
        watcher.on_discovery(vec![instance(9001)]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        watcher.on_discovery(vec![instance(9002)]);
        watcher.on_discovery(vec![instance(9003)]);

        wait_until(|| directory_addresses(&directory) == vec!["10.0.0.1:9003"]).await;
        assert!(!fetcher
            .fetched_addresses()
            .contains(&"10.0.0.1:9002".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_groups_diff_independently() {
        let fetcher = Arc::new(MapFetcher::new(HashMap::from([
            ("10.0.0.1:9001".to_string(), vec!["org.demo.Greeter".to_string()]),
            ("10.0.0.1:9002".to_string(), vec!["org.demo.Greeter".to_string()]),
        ])));
        let watcher = AppInstanceWatcher::new("demo-app", fetcher.clone());
        let directory = Directory::new("org.demo.Greeter", Arc::new(PassiveFactory::default()));
        watcher
            .watch_service("org.demo.Greeter", directory.clone())
            .await;

        let blue = instance(9001).group("blue");
        let green = instance(9002).group("green");
        watcher.on_discovery(vec![blue.clone(), green.clone()]);
        wait_until(|| directory.list().len() == 2).await;

        // green group empties; blue is untouched
        watcher.on_discovery(vec![blue.clone()]);
        wait_until(|| directory.list().len() == 1).await;
        assert_eq!(directory_addresses(&directory), vec!["10.0.0.1:9001"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_fetch_is_retried_on_next_snapshot() {
        struct FlakyFetcher {
            inner: MapFetcher,
            fail_first: AtomicBool,
        }

        #[async_trait]
        impl MetadataFetcher for FlakyFetcher {
            async fn fetch(
                &self,
                instance: &ApplicationInstance,
            ) -> Result<FetchedMetadata, StdError> {
                if self.fail_first.swap(false, Ordering::SeqCst) {
                    return Err("metadata service not up yet".into());
                }
                self.inner.fetch(instance).await
            }
        }

        let fetcher = Arc::new(FlakyFetcher {
            inner: MapFetcher::new(HashMap::from([(
                "10.0.0.1:9001".to_string(),
                vec!["org.demo.Greeter".to_string()],
            )])),
            fail_first: AtomicBool::new(true),
        });
        let watcher = AppInstanceWatcher::new("demo-app", fetcher.clone());
        let directory = Directory::new("org.demo.Greeter", Arc::new(PassiveFactory::default()));
        watcher
            .watch_service("org.demo.Greeter", directory.clone())
            .await;

        watcher.on_discovery(vec![instance(9001)]);
        // first pass drops the instance; the repeated snapshot brings it in
        wait_until(|| !fetcher.fail_first.load(Ordering::SeqCst)).await;
        watcher.on_discovery(vec![instance(9001)]);
        wait_until(|| directory.list().len() == 1).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_destroy_tears_everything_down() {
        let fetcher = Arc::new(MapFetcher::new(HashMap::from([(
            "10.0.0.1:9001".to_string(),
            vec!["org.demo.Greeter".to_string()],
        )])));
        let watcher = AppInstanceWatcher::new("demo-app", fetcher.clone());
        let directory = Directory::new("org.demo.Greeter", Arc::new(PassiveFactory::default()));
        watcher
            .watch_service("org.demo.Greeter", directory.clone())
            .await;

        watcher.on_discovery(vec![instance(9001)]);
        wait_until(|| directory.list().len() == 1).await;

        watcher.destroy().await;
        watcher.destroy().await;
        assert!(directory.is_destroyed());
        assert!(fetcher
            .metadata_invokers
            .lock()
            .unwrap()
            .iter()
            .all(|invoker| invoker.destroyed.load(Ordering::SeqCst)));

        // snapshots after destroy are ignored
        watcher.on_discovery(vec![instance(9001)]);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(directory.list().is_empty());
    }

    #[test]
    fn test_default_config() {
        let config = WatcherConfig::default();
        assert_eq!(config.max_drain, 5);
    }
}
