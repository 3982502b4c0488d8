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

pub mod memory;

pub use memory::MemoryRegistry;

use std::sync::Arc;

use async_trait::async_trait;
use spire_base::{ApplicationInstance, StdError};
use spire_config::{ReferenceConfig, ServiceConfig};

/// Receives full-state instance snapshots for one subscribed application.
/// Notifications must not block; heavy work belongs on the listener's own
/// tasks.
pub trait NotifyListener: Send + Sync {
    fn notify(&self, instances: Vec<ApplicationInstance>);
}

/// Application-level registry seam. Implementations publish this process's
/// instances and stream other applications' membership back as snapshots,
/// never as incremental deltas.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, config: &ServiceConfig) -> Result<(), StdError>;

    async fn unregister(&self, config: &ServiceConfig) -> Result<(), StdError>;

    async fn subscribe(
        &self,
        config: &ReferenceConfig,
        listener: Arc<dyn NotifyListener>,
    ) -> Result<(), StdError>;

    async fn unsubscribe(&self, config: &ReferenceConfig) -> Result<(), StdError>;
}
