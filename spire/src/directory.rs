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
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use spire_base::{StdError, Url};
use tracing::{info, warn};

use crate::invoker::Invoker;

/// Builds a connected leaf invoker for one `(service, address)` pair.
/// The factory owns connection reuse; asking it twice for the same address
/// must not open two connections.
#[async_trait]
pub trait InvokerFactory: Send + Sync {
    async fn create(
        &self,
        service_name: &str,
        url: &Url,
    ) -> Result<Arc<dyn Invoker>, StdError>;
}

/// The live invoker set for one service, updated by discovery and read by
/// callers picking a target.
///
/// `refresh` diffs the incoming address list against the current set,
/// make-before-break: new invokers are created and published before stale
/// ones are destroyed, so readers never observe an artificially empty list
/// while membership merely rotates.
pub struct Directory {
    service_name: String,
    factory: Arc<dyn InvokerFactory>,
    // address -> invoker; guarded by the same lock that rebuilds the
    // published snapshot so refresh runs are serialized
    invokers: tokio::sync::Mutex<HashMap<String, Arc<dyn Invoker>>>,
    published: Mutex<Arc<Vec<Arc<dyn Invoker>>>>,
    destroyed: AtomicBool,
}

impl Directory {
    pub fn new(service_name: &str, factory: Arc<dyn InvokerFactory>) -> Arc<Self> {
        Arc::new(Directory {
            service_name: service_name.to_string(),
            factory,
            invokers: tokio::sync::Mutex::new(HashMap::new()),
            published: Mutex::new(Arc::new(Vec::new())),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Currently usable invokers. Unavailable ones are filtered here at
    /// read time rather than evicted; they come back by the same filter
    /// once their connection recovers.
    pub fn list(&self) -> Vec<Arc<dyn Invoker>> {
        self.snapshot()
            .iter()
            .filter(|invoker| invoker.is_available())
            .cloned()
            .collect()
    }

    /// Full membership, including currently unavailable invokers.
    pub fn list_all(&self) -> Vec<Arc<dyn Invoker>> {
        self.snapshot().as_ref().clone()
    }

    fn snapshot(&self) -> Arc<Vec<Arc<dyn Invoker>>> {
        self.published
            .lock()
            .expect("directory snapshot lock poisoned")
            .clone()
    }

    fn publish(&self, list: Vec<Arc<dyn Invoker>>) {
        *self
            .published
            .lock()
            .expect("directory snapshot lock poisoned") = Arc::new(list);
    }

    /// Reconciles membership with a fresh address list from discovery.
    /// A factory failure skips that address and keeps the rest of the
    /// update; the next refresh retries it.
    pub async fn refresh(&self, urls: Vec<Url>) {
        if self.is_destroyed() {
            return;
        }

        let mut invokers = self.invokers.lock().await;
        if self.is_destroyed() {
            return;
        }

        let incoming: HashMap<String, Url> = urls
            .into_iter()
            .map(|url| (url.address(), url))
            .collect();

        for (address, url) in &incoming {
            if invokers.contains_key(address) {
                continue;
            }
            match self.factory.create(&self.service_name, url).await {
                Ok(invoker) => {
                    info!("directory {} added {}", self.service_name, address);
                    invokers.insert(address.clone(), invoker);
                }
                Err(err) => {
                    warn!(
                        "directory {} failed to build invoker for {}: {}",
                        self.service_name, address, err
                    );
                }
            }
        }

        let stale: Vec<String> = invokers
            .keys()
            .filter(|address| !incoming.contains_key(*address))
            .cloned()
            .collect();

        self.publish(
            invokers
                .values()
                .filter(|invoker| !stale.contains(&invoker.url().address()))
                .cloned()
                .collect(),
        );

        for address in stale {
            if let Some(invoker) = invokers.remove(&address) {
                info!("directory {} removed {}", self.service_name, address);
                invoker.destroy().await;
            }
        }
    }

    /// Tears the directory down; idempotent. Readers see an empty list
    /// immediately, then every held invoker is destroyed.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.publish(Vec::new());
        let mut invokers = self.invokers.lock().await;
        for (_, invoker) in invokers.drain() {
            invoker.destroy().await;
        }
        info!("directory {} destroyed", self.service_name);
    }
}
