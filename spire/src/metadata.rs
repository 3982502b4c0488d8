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

//! Application-level discovery learns which services an instance hosts by
//! calling the instance's own built-in metadata service.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use spire_base::{
    constants::METADATA_SERVICE_NAME, AppMetadata, ApplicationInstance, StdError,
};

use crate::{directory::InvokerFactory, invocation::Invocation, invoker::Invoker};

pub const METADATA_HANDLER: &str = "getMetadata";

#[derive(Deserialize)]
struct MetadataPayload {
    services: HashMap<String, HashMap<String, String>>,
}

/// Fetch outcome: the parsed metadata plus the invoker that produced it,
/// kept alive by the watcher for later revocation fetches and torn down
/// when the instance leaves.
pub struct FetchedMetadata {
    pub metadata: AppMetadata,
    pub invoker: Arc<dyn Invoker>,
}

#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    async fn fetch(&self, instance: &ApplicationInstance) -> Result<FetchedMetadata, StdError>;
}

/// Production fetcher: dials the instance and calls its metadata service
/// like any other RPC.
pub struct RemoteMetadataFetcher {
    factory: Arc<dyn InvokerFactory>,
}

impl RemoteMetadataFetcher {
    pub fn new(factory: Arc<dyn InvokerFactory>) -> Self {
        RemoteMetadataFetcher { factory }
    }
}

#[async_trait]
impl MetadataFetcher for RemoteMetadataFetcher {
    async fn fetch(&self, instance: &ApplicationInstance) -> Result<FetchedMetadata, StdError> {
        let mut url = instance.to_url();
        url.service_name = METADATA_SERVICE_NAME.to_string();

        let invoker = self.factory.create(METADATA_SERVICE_NAME, &url).await?;
        let invocation = Invocation::new(METADATA_SERVICE_NAME, METADATA_HANDLER, vec![]);
        let response = invoker.invoke(invocation).await.response().await;
        let value = response.into_result()?;

        let payload: MetadataPayload = serde_json::from_value(value)?;
        Ok(FetchedMetadata {
            metadata: AppMetadata {
                services: payload.services,
            },
            invoker,
        })
    }
}
