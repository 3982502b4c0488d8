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
    str::FromStr,
};

use http::Uri;
use thiserror::Error;

/// Address of one remote endpoint, eg. `spire://10.0.0.1:9000/org.demo.Greeter?group=blue`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Url {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    // path component, the logical service name when present
    pub service_name: String,
    pub params: HashMap<String, String>,
}

#[derive(Error, Debug)]
#[error("invalid url: {0}")]
pub struct InvalidUrl(String);

impl Url {
    pub fn from_url(url: &str) -> Result<Self, InvalidUrl> {
        let uri = url
            .parse::<Uri>()
            .map_err(|err| InvalidUrl(format!("{}, err: {}", url, err)))?;

        let authority = uri
            .authority()
            .ok_or_else(|| InvalidUrl(format!("{}, missing authority", url)))?;
        let port = authority
            .port_u16()
            .ok_or_else(|| InvalidUrl(format!("{}, missing port", url)))?;

        let params = match uri.path_and_query().and_then(|pq| pq.query()) {
            Some(query) => Self::decode_params(query),
            None => HashMap::new(),
        };

        Ok(Url {
            scheme: uri.scheme_str().unwrap_or("spire").to_string(),
            host: authority.host().to_string(),
            port,
            service_name: uri.path().trim_start_matches('/').to_string(),
            params,
        })
    }

    pub fn from_host_port(host: &str, port: u16) -> Self {
        Url {
            scheme: "spire".to_string(),
            host: host.to_string(),
            port,
            service_name: String::new(),
            params: HashMap::new(),
        }
    }

    pub fn get_param(&self, key: &str) -> Option<String> {
        self.params.get(key).cloned()
    }

    pub fn set_param(&mut self, key: &str, value: &str) {
        self.params.insert(key.to_string(), value.to_string());
    }

    /// `host:port`, the identity the remoting layer connects and dedups on.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn decode_params(raw_query: &str) -> HashMap<String, String> {
        let mut params = HashMap::new();
        for pair in raw_query.split('&') {
            let mut kv = pair.trim().splitn(2, '=');
            let (Some(k), Some(v)) = (kv.next(), kv.next()) else {
                continue;
            };
            let v = urlencoding::decode(v)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| v.to_string());
            params.insert(k.to_string(), v);
        }
        params
    }

    fn encode_params(&self) -> String {
        if self.params.is_empty() {
            return String::new();
        }
        let mut params_vec: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();
        params_vec.sort();
        format!("?{}", params_vec.join("&"))
    }
}

impl Display for Url {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}:{}/{}{}",
            self.scheme,
            self.host,
            self.port,
            self.service_name,
            self.encode_params()
        )
    }
}

impl FromStr for Url {
    type Err = InvalidUrl;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Url::from_url(s)
    }
}
