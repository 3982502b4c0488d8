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

//! Chain construction. A chain is resolved once from an ordered filter
//! (or interceptor) list plus a tail invoker, wrapped right-to-left so
//! stage *i* sees "stages i+1..n + tail" as its downstream invoker.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use spire_base::Url;
use tracing::error;

use crate::{
    filter::Filter,
    interceptor::{Interceptor, INTERCEPTOR_CHAIN_ATTR},
    invocation::Invocation,
    invoker::Invoker,
    result::RpcResult,
};

struct FilterInvoker {
    filter: Arc<dyn Filter>,
    next: Arc<dyn Invoker>,
}

#[async_trait]
impl Invoker for FilterInvoker {
    fn service_name(&self) -> &str {
        self.next.service_name()
    }

    fn url(&self) -> &Url {
        self.next.url()
    }

    async fn invoke(&self, invocation: Invocation) -> RpcResult {
        self.filter.invoke(self.next.clone(), invocation).await
    }

    fn is_available(&self) -> bool {
        self.next.is_available()
    }
}

/// Builds a [`FilterChain`]. User filters sort ascending by `order()`;
/// internal-pre filters always run first and internal-post filters always
/// last, whatever their order values — framework-mandated stages must not
/// be displaced by user configuration.
#[derive(Default)]
pub struct FilterChainBuilder {
    pre: Vec<Arc<dyn Filter>>,
    user: Vec<Arc<dyn Filter>>,
    post: Vec<Arc<dyn Filter>>,
}

impl FilterChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn internal_pre(mut self, filter: Arc<dyn Filter>) -> Self {
        self.pre.push(filter);
        self
    }

    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.user.push(filter);
        self
    }

    pub fn internal_post(mut self, filter: Arc<dyn Filter>) -> Self {
        self.post.push(filter);
        self
    }

    pub fn build(self, tail: Arc<dyn Invoker>) -> FilterChain {
        let FilterChainBuilder { pre, mut user, post } = self;
        user.sort_by_key(|filter| filter.order());

        let mut filters = pre;
        filters.extend(user);
        filters.extend(post);

        let mut head = tail.clone();
        for filter in filters.iter().rev() {
            head = Arc::new(FilterInvoker {
                filter: filter.clone(),
                next: head,
            });
        }

        FilterChain {
            head,
            filters,
            tail,
        }
    }
}

/// An immutable, ordered filter chain around a tail invoker.
///
/// Invocation is two-phase: the wrapped chain runs to completion first,
/// then every filter's `on_response` hook runs over the final response in
/// chain order. The flat second pass (rather than unwinding through the
/// nesting) lets a later, lower-priority filter override what an earlier
/// one decided, because each hook sees the result after all invoke stages
/// are done.
pub struct FilterChain {
    head: Arc<dyn Invoker>,
    filters: Vec<Arc<dyn Filter>>,
    tail: Arc<dyn Invoker>,
}

#[async_trait]
impl Invoker for FilterChain {
    fn service_name(&self) -> &str {
        self.tail.service_name()
    }

    fn url(&self) -> &Url {
        self.tail.url()
    }

    async fn invoke(&self, invocation: Invocation) -> RpcResult {
        let outward = RpcResult::pending();

        let inner = self.head.invoke(invocation.clone()).await;
        let mut response = inner.response().await;

        // post-processing is best-effort: the call already happened, so a
        // failing hook is logged and the next hook still runs
        for filter in &self.filters {
            if let Err(err) = filter.on_response(&invocation, &mut response) {
                error!(
                    "on_response failed for {}: {}",
                    invocation.handler_key(),
                    err
                );
            }
        }

        outward.complete(response);
        outward
    }

    fn is_available(&self) -> bool {
        self.tail.is_available()
    }

    async fn destroy(&self) {
        self.tail.destroy().await;
    }
}

struct InterceptorInvoker {
    interceptor: Arc<dyn Interceptor>,
    next: Arc<dyn Invoker>,
}

#[async_trait]
impl Invoker for InterceptorInvoker {
    fn service_name(&self) -> &str {
        self.next.service_name()
    }

    fn url(&self) -> &Url {
        self.next.url()
    }

    async fn invoke(&self, invocation: Invocation) -> RpcResult {
        self.interceptor
            .intercept(self.next.clone(), invocation)
            .await
    }

    fn is_available(&self) -> bool {
        self.next.is_available()
    }
}

#[derive(Default)]
pub struct InterceptorChainBuilder {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self, tail: Arc<dyn Invoker>) -> Arc<InterceptorChain> {
        let mut interceptors = self.interceptors;
        interceptors.sort_by_key(|interceptor| interceptor.order());

        Arc::new_cyclic(|me| {
            let mut head = tail.clone();
            for interceptor in interceptors.iter().rev() {
                head = Arc::new(InterceptorInvoker {
                    interceptor: interceptor.clone(),
                    next: head,
                });
            }
            InterceptorChain {
                head,
                tail,
                me: me.clone(),
            }
        })
    }
}

/// Interceptor counterpart of [`FilterChain`]. Before invoking, the chain
/// stamps itself into the invocation's attributes so nested code can
/// introspect or re-enter it.
pub struct InterceptorChain {
    head: Arc<dyn Invoker>,
    tail: Arc<dyn Invoker>,
    me: Weak<InterceptorChain>,
}

#[async_trait]
impl Invoker for InterceptorChain {
    fn service_name(&self) -> &str {
        self.tail.service_name()
    }

    fn url(&self) -> &Url {
        self.tail.url()
    }

    async fn invoke(&self, invocation: Invocation) -> RpcResult {
        if let Some(chain) = self.me.upgrade() {
            invocation.put_attribute(INTERCEPTOR_CHAIN_ATTR, chain);
        }
        self.head.invoke(invocation).await
    }

    fn is_available(&self) -> bool {
        self.tail.is_available()
    }

    async fn destroy(&self) {
        self.tail.destroy().await;
    }
}
