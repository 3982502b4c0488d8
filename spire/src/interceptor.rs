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

use crate::{invocation::Invocation, invoker::Invoker, result::RpcResult};

/// Invocation attribute key under which the running
/// [`InterceptorChain`](crate::chain::InterceptorChain) publishes itself,
/// so nested code can introspect or re-enter the chain.
pub const INTERCEPTOR_CHAIN_ATTR: &str = "spire.interceptor.chain";

/// Same composition model as [`Filter`](crate::filter::Filter), without
/// the post-completion hook; interceptors that need to observe the result
/// await `next` and act on the returned response.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn order(&self) -> i32 {
        0
    }

    async fn intercept(&self, next: Arc<dyn Invoker>, invocation: Invocation) -> RpcResult {
        next.invoke(invocation).await
    }
}
