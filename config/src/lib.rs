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

pub mod reference;
pub mod registry;
pub mod service;

pub use reference::ReferenceConfig;
pub use registry::RegistryConfig;
pub use service::ServiceConfig;

use serde::{Deserialize, Serialize};

/// Root config loadable from a yaml document.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct RootConfig {
    #[serde(default)]
    pub application: String,
    #[serde(default)]
    pub registries: Vec<RegistryConfig>,
    #[serde(default)]
    pub references: Vec<ReferenceConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl RootConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

#[cfg(test)]
mod tests {
    use super::RootConfig;

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
application: demo-consumer
registries:
  - protocol: memory
    address: memory://127.0.0.1:0
references:
  - interface: org.demo.Greeter
    app_name: demo-provider
    timeout_ms: 3000
"#;
        let config = RootConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.application, "demo-consumer");
        assert_eq!(config.registries.len(), 1);
        assert_eq!(config.references[0].interface, "org.demo.Greeter");
        assert_eq!(config.references[0].timeout_ms, 3000);
    }
}
