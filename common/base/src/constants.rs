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

pub const GROUP_KEY: &str = "group";
pub const WEIGHT_KEY: &str = "weight";
pub const SCHEME_KEY: &str = "scheme";
pub const APPLICATION_KEY: &str = "application";
pub const INTERFACE_KEY: &str = "interface";
pub const SERIALIZATION_KEY: &str = "serialization";
pub const TIMEOUT_KEY: &str = "timeout";

pub const DEFAULT_GROUP: &str = "default";
pub const DEFAULT_WEIGHT: i32 = 100;

/// Well-known service name of the built-in metadata service every
/// application instance exposes.
pub const METADATA_SERVICE_NAME: &str = "spire.metadata.MetadataService";
