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
use dashmap::DashMap;
use spire_base::{ApplicationInstance, StdError};
use spire_config::{ReferenceConfig, ServiceConfig};
use tracing::info;

use super::{NotifyListener, Registry};

fn instance_of(config: &ServiceConfig) -> ApplicationInstance {
    let mut instance = ApplicationInstance::new(&config.app_name, &config.host, config.port);
    if !config.group.is_empty() {
        instance = instance.group(&config.group);
    }
    if config.weight > 0 {
        instance = instance.weight(config.weight);
    }
    instance.metadata = config.metadata.clone();
    instance
}

/// Process-local registry, used in tests and single-process deployments.
/// Every membership change fans the application's full instance list out
/// to its subscribers.
#[derive(Default)]
pub struct MemoryRegistry {
    instances: DashMap<String, Vec<ApplicationInstance>>,
    listeners: DashMap<String, Vec<Arc<dyn NotifyListener>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self, app_name: &str) -> Vec<ApplicationInstance> {
        self.instances
            .get(app_name)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    fn publish(&self, app_name: &str) {
        let snapshot = self.snapshot(app_name);
        if let Some(listeners) = self.listeners.get(app_name) {
            for listener in listeners.iter() {
                listener.notify(snapshot.clone());
            }
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, config: &ServiceConfig) -> Result<(), StdError> {
        let instance = instance_of(config);
        info!("registering {}", instance);
        let app_name = instance.app_name.clone();
        {
            let mut entry = self.instances.entry(app_name.clone()).or_default();
            entry.retain(|existing| *existing != instance);
            entry.push(instance);
        }
        self.publish(&app_name);
        Ok(())
    }

    async fn unregister(&self, config: &ServiceConfig) -> Result<(), StdError> {
        let instance = instance_of(config);
        info!("unregistering {}", instance);
        let app_name = instance.app_name.clone();
        if let Some(mut entry) = self.instances.get_mut(&app_name) {
            entry.retain(|existing| *existing != instance);
        }
        self.publish(&app_name);
        Ok(())
    }

    async fn subscribe(
        &self,
        config: &ReferenceConfig,
        listener: Arc<dyn NotifyListener>,
    ) -> Result<(), StdError> {
        // new subscribers see current membership immediately
        listener.notify(self.snapshot(&config.app_name));
        self.listeners
            .entry(config.app_name.clone())
            .or_default()
            .push(listener);
        Ok(())
    }

    async fn unsubscribe(&self, config: &ReferenceConfig) -> Result<(), StdError> {
        self.listeners.remove(&config.app_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use spire_base::ApplicationInstance;
    use spire_config::{ReferenceConfig, ServiceConfig};

    use super::{MemoryRegistry, NotifyListener, Registry};

    #[derive(Default)]
    struct RecordingListener {
        snapshots: Mutex<Vec<Vec<ApplicationInstance>>>,
    }

    impl NotifyListener for RecordingListener {
        fn notify(&self, instances: Vec<ApplicationInstance>) {
            self.snapshots.lock().unwrap().push(instances);
        }
    }

    fn service(port: u16) -> ServiceConfig {
        ServiceConfig::new("org.demo.Greeter", "demo-app", "10.0.0.1", port)
    }

    fn reference() -> ReferenceConfig {
        ReferenceConfig::new("org.demo.Greeter").app_name("demo-app")
    }

    #[tokio::test]
    async fn test_subscriber_sees_full_snapshots() {
        let registry = MemoryRegistry::new();
        let listener = Arc::new(RecordingListener::default());

        registry.register(&service(9001)).await.unwrap();
        registry
            .subscribe(&reference(), listener.clone())
            .await
            .unwrap();
        registry.register(&service(9002)).await.unwrap();
        registry.unregister(&service(9001)).await.unwrap();

        let snapshots = listener.snapshots.lock().unwrap();
        // initial snapshot on subscribe, then one per change
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].len(), 1);
        assert_eq!(snapshots[1].len(), 2);
        assert_eq!(snapshots[2].len(), 1);
        assert_eq!(snapshots[2][0].port, 9002);
    }

    #[tokio::test]
    async fn test_reregistration_replaces_same_identity() {
        let registry = MemoryRegistry::new();
        registry.register(&service(9001)).await.unwrap();
        let mut updated = service(9001);
        updated.weight = 7;
        registry.register(&updated).await.unwrap();

        let listener = Arc::new(RecordingListener::default());
        registry
            .subscribe(&reference(), listener.clone())
            .await
            .unwrap();
        let snapshots = listener.snapshots.lock().unwrap();
        assert_eq!(snapshots[0].len(), 1);
        assert_eq!(snapshots[0][0].weight, 7);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_notifications() {
        let registry = MemoryRegistry::new();
        let listener = Arc::new(RecordingListener::default());
        registry
            .subscribe(&reference(), listener.clone())
            .await
            .unwrap();
        registry.unsubscribe(&reference()).await.unwrap();
        registry.register(&service(9001)).await.unwrap();

        assert_eq!(listener.snapshots.lock().unwrap().len(), 1);
    }
}
