// III-IV
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Shared scaffolding for microservices.
//!
//! Every service needs to load its configuration, expose an HTTP API and talk to some external
//! systems.  This crate provides the pieces that are common to all of them:
//!
//! 1.  `config`: Typed configuration loading.  Services describe their settings with a `Schema`
//!     and `ConfigLoader` fills them from defaults, a YAML file, secret files, environment
//!     variables and explicit overrides, reporting all invalid fields at once.
//!
//! 1.  `api`: HTTP server bootstrap on top of `axum`, including CORS setup, logging
//!     initialization and the mapping of errors to HTTP responses.
//!
//! 1.  `events`: Broker-independent validation and stamping of JSON event messages.
//!
//! 1.  `storage`: Abstraction over object storage systems.
//!
//! This crate does not have any heavy dependencies except those that are required for all services.
//! Clients for databases, message brokers and object storage are introduced by depending on
//! sibling crates, all of which take their settings from types loaded via `config`.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

pub mod api;
pub mod clocks;
pub mod config;
pub mod env;
pub mod events;
pub mod storage;
