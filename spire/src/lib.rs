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

//! Client-side RPC core: the invocation pipeline (filter/interceptor
//! chains over a single [`Invoker`] trait), per-connection reference
//! invokers, per-service directories maintained by discovery, and the
//! application-instance watcher that turns registry snapshots into
//! directory updates.

pub mod chain;
pub mod codec;
pub mod directory;
pub mod discovery;
pub mod filter;
pub mod framework;
pub mod interceptor;
pub mod invocation;
pub mod invoker;
pub mod metadata;
pub mod reference;
pub mod registry;
pub mod result;
pub mod service;

pub use chain::{FilterChain, FilterChainBuilder, InterceptorChain, InterceptorChainBuilder};
pub use codec::{JsonSerializer, Serializer};
pub use directory::{Directory, InvokerFactory};
pub use discovery::{AppInstanceWatcher, WatcherConfig};
pub use filter::Filter;
pub use framework::{ClusterInvoker, SpireRuntime};
pub use interceptor::Interceptor;
pub use invocation::Invocation;
pub use invoker::Invoker;
pub use metadata::{FetchedMetadata, MetadataFetcher, RemoteMetadataFetcher};
pub use reference::{ClientRelease, ReferenceInvoker};
pub use registry::{MemoryRegistry, NotifyListener, Registry};
pub use result::{RpcError, RpcResponse, RpcResult, Value};
pub use service::{MethodHandler, MethodRegistry};

pub use spire_base::StdError;
pub use spire_logger::init as init_logging;
