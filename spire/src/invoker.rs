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

use async_trait::async_trait;
use spire_base::Url;

use crate::{invocation::Invocation, result::RpcResult};

/// The unit of call dispatch: anything that can execute an [`Invocation`]
/// and produce an [`RpcResult`].
///
/// Ordinary call failures come back inside a completed-with-error result;
/// `invoke` itself only panics on programming errors. Chains are built by
/// wrapping an invoker in another invoker holding a `next` reference — one
/// trait, no delegation hierarchy.
#[async_trait]
pub trait Invoker: Send + Sync {
    fn service_name(&self) -> &str;

    fn url(&self) -> &Url;

    async fn invoke(&self, invocation: Invocation) -> RpcResult;

    fn is_available(&self) -> bool {
        true
    }

    async fn destroy(&self) {}
}
