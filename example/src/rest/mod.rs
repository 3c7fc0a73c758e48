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

//! Entry point to the REST server.

use axum::Router;
use std::sync::Arc;

mod index_get;

/// Creates the router for the application, which greets `greeting`.
pub(crate) fn app(greeting: String) -> Router {
    use axum::routing::get;
    Router::new().route("/", get(index_get::handler)).with_state(Arc::new(greeting))
}
