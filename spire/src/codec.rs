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

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use spire_base::StdError;

use crate::result::Value;

/// Argument list as carried in a request command payload.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct CallArgs {
    pub args: Vec<Value>,
}

/// Pluggable payload codec. One serializer instance is shared by every
/// reference invoker built from the same runtime.
pub trait Serializer: Send + Sync {
    fn name(&self) -> &'static str;

    fn serialize_args(&self, args: &[Value]) -> Result<Bytes, StdError>;

    fn deserialize_args(&self, payload: &[u8]) -> Result<Vec<Value>, StdError>;

    fn serialize_value(&self, value: &Value) -> Result<Bytes, StdError>;

    fn deserialize_value(&self, payload: &[u8]) -> Result<Value, StdError>;
}

#[derive(Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize_args(&self, args: &[Value]) -> Result<Bytes, StdError> {
        let payload = CallArgs {
            args: args.to_vec(),
        };
        Ok(Bytes::from(serde_json::to_vec(&payload)?))
    }

    fn deserialize_args(&self, payload: &[u8]) -> Result<Vec<Value>, StdError> {
        let payload: CallArgs = serde_json::from_slice(payload)?;
        Ok(payload.args)
    }

    fn serialize_value(&self, value: &Value) -> Result<Bytes, StdError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn deserialize_value(&self, payload: &[u8]) -> Result<Value, StdError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
