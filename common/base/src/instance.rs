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

use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
    hash::{Hash, Hasher},
};

use crate::{
    constants::{DEFAULT_GROUP, DEFAULT_WEIGHT},
    url::Url,
};

/// One remote process as the registry sees it. Identity is
/// host + port + group; everything else is descriptive.
#[derive(Debug, Clone)]
pub struct ApplicationInstance {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub group: String,
    pub weight: i32,
    pub metadata: HashMap<String, String>,
}

impl ApplicationInstance {
    pub fn new(app_name: &str, host: &str, port: u16) -> Self {
        ApplicationInstance {
            app_name: app_name.to_string(),
            host: host.to_string(),
            port,
            scheme: "spire".to_string(),
            group: DEFAULT_GROUP.to_string(),
            weight: DEFAULT_WEIGHT,
            metadata: HashMap::new(),
        }
    }

    pub fn group(mut self, group: &str) -> Self {
        self.group = group.to_string();
        self
    }

    pub fn weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn to_url(&self) -> Url {
        let mut url = Url::from_host_port(&self.host, self.port);
        url.scheme = self.scheme.clone();
        url
    }
}

impl PartialEq for ApplicationInstance {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.group == other.group
    }
}

impl Eq for ApplicationInstance {}

impl Hash for ApplicationInstance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.group.hash(state);
    }
}

impl Display for ApplicationInstance {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}({})", self.app_name, self.host, self.port, self.group)
    }
}

/// One service hosted by one application instance. Identity is host + port
/// + service name, so directories can dedup across discovery passes.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub weight: i32,
}

impl ServiceInstance {
    pub fn new(service_name: &str, instance: &ApplicationInstance) -> Self {
        ServiceInstance {
            service_name: service_name.to_string(),
            host: instance.host.clone(),
            port: instance.port,
            scheme: instance.scheme.clone(),
            weight: instance.weight,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn to_url(&self) -> Url {
        let mut url = Url::from_host_port(&self.host, self.port);
        url.scheme = self.scheme.clone();
        url.service_name = self.service_name.clone();
        url
    }
}

impl PartialEq for ServiceInstance {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.service_name == other.service_name
    }
}

impl Eq for ServiceInstance {}

impl Hash for ServiceInstance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.service_name.hash(state);
    }
}

/// The services one application instance reported through its metadata
/// service.
#[derive(Debug, Clone, Default)]
pub struct AppMetadata {
    pub services: HashMap<String, HashMap<String, String>>,
}

impl AppMetadata {
    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }
}
