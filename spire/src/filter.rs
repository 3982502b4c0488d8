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

//! Filters preprocess the outgoing invocation and postprocess its final
//! result. They are resolved into an immutable chain once, at invoker
//! construction; reordering means rebuilding the chain.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use spire_base::StdError;
use tracing::info;

use crate::{
    invocation::Invocation,
    invoker::Invoker,
    result::{RpcResponse, RpcResult},
};

pub const CONSUMER_APP_ATTACHMENT: &str = "spire.consumer.application";
const CALL_START_ATTR: &str = "spire.call.start";

/// Cross-cutting call policy. Lower `order()` runs closer to the caller.
///
/// `invoke` must call `next.invoke(..)` or short-circuit by returning an
/// already-completed result. `on_response` runs once the tail's result is
/// fully resolved and may rewrite it in place — including failing a
/// successful call, which some framework toggles rely on.
#[async_trait]
pub trait Filter: Send + Sync {
    fn order(&self) -> i32 {
        0
    }

    async fn invoke(&self, next: Arc<dyn Invoker>, invocation: Invocation) -> RpcResult {
        next.invoke(invocation).await
    }

    fn on_response(
        &self,
        invocation: &Invocation,
        response: &mut RpcResponse,
    ) -> Result<(), StdError> {
        let _ = (invocation, response);
        Ok(())
    }
}

/// Internal-pre filter stamping the consuming application onto every
/// outgoing invocation.
pub struct ConsumerContextFilter {
    application: String,
}

impl ConsumerContextFilter {
    pub fn new(application: &str) -> Self {
        ConsumerContextFilter {
            application: application.to_string(),
        }
    }
}

#[async_trait]
impl Filter for ConsumerContextFilter {
    async fn invoke(&self, next: Arc<dyn Invoker>, invocation: Invocation) -> RpcResult {
        invocation.put_attachment(CONSUMER_APP_ATTACHMENT, &self.application);
        next.invoke(invocation).await
    }
}

/// Logs every call's outcome and latency. The start instant rides on the
/// invocation's local attributes so the hook sees it without thread-local
/// state.
#[derive(Default)]
pub struct CallLogFilter;

#[async_trait]
impl Filter for CallLogFilter {
    fn order(&self) -> i32 {
        i32::MAX
    }

    async fn invoke(&self, next: Arc<dyn Invoker>, invocation: Invocation) -> RpcResult {
        invocation.put_attribute(CALL_START_ATTR, Arc::new(Instant::now()));
        next.invoke(invocation).await
    }

    fn on_response(
        &self,
        invocation: &Invocation,
        response: &mut RpcResponse,
    ) -> Result<(), StdError> {
        let elapsed = invocation
            .attribute::<Instant>(CALL_START_ATTR)
            .map(|start| start.elapsed());
        info!(
            "call {} ok={} elapsed={:?}",
            invocation.handler_key(),
            response.is_ok(),
            elapsed
        );
        Ok(())
    }
}
