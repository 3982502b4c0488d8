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

use serde::{Deserialize, Serialize};
use spire_base::constants::DEFAULT_GROUP;

fn default_timeout_ms() -> u64 {
    3000
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

/// Consumer-side description of one remote interface.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReferenceConfig {
    /// Logical service (interface) name, eg. `org.demo.Greeter`.
    pub interface: String,
    /// Application hosting the service, the unit the registry watches.
    #[serde(default)]
    pub app_name: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub serializer: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ReferenceConfig {
    pub fn new(interface: &str) -> Self {
        ReferenceConfig {
            interface: interface.to_string(),
            app_name: String::new(),
            group: default_group(),
            serializer: String::new(),
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn app_name(self, app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            ..self
        }
    }

    pub fn group(self, group: &str) -> Self {
        Self {
            group: group.to_string(),
            ..self
        }
    }

    pub fn timeout_ms(self, timeout_ms: u64) -> Self {
        Self { timeout_ms, ..self }
    }
}
