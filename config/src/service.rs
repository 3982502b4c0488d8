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

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use spire_base::constants::{DEFAULT_GROUP, DEFAULT_WEIGHT};

/// Provider-side description of one exported service.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    pub interface: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub weight: i32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceConfig {
    pub fn new(interface: &str, app_name: &str, host: &str, port: u16) -> Self {
        ServiceConfig {
            interface: interface.to_string(),
            app_name: app_name.to_string(),
            group: DEFAULT_GROUP.to_string(),
            host: host.to_string(),
            port,
            weight: DEFAULT_WEIGHT,
            metadata: HashMap::new(),
        }
    }

    pub fn group(self, group: &str) -> Self {
        Self {
            group: group.to_string(),
            ..self
        }
    }
}
