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

//! Sample REST service that greets whoever is configured.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

use chassis_core::api::{ApiConfig, configure_app, run_server};
use chassis_core::config::{ConfigLoader, ConfigResult, Field, Kind, Schema, Settings};
use serde::Deserialize;
use std::error::Error;

mod rest;
use rest::app;

/// Prefix of the configuration files and environment variables of this service.
pub const CONFIG_PREFIX: &str = "hello_world";

/// Settings of the service.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct HelloConfig {
    /// Settings of the HTTP server.
    #[serde(flatten)]
    pub api: ApiConfig,

    /// Who to greet.
    pub greeting: String,
}

impl Settings for HelloConfig {
    fn schema() -> Schema {
        ApiConfig::schema()
            .field(Field::with_default("greeting", Kind::String, "World").describe("Who to greet"))
    }
}

/// Loads the service settings from the default locations.
pub fn load_config() -> ConfigResult<HelloConfig> {
    ConfigLoader::new(CONFIG_PREFIX).load()
}

/// Instantiates all resources to serve the application as described by `config`.
pub async fn serve(config: HelloConfig) -> Result<(), Box<dyn Error>> {
    let app = configure_app(app(config.greeting), &config.api)?;
    run_server(app, &config.api).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ConfigLoader::new("hello_world_unit")
            .with_search_dirs(vec![])
            .load::<HelloConfig>()
            .unwrap();
        assert_eq!("World", config.greeting);
        assert_eq!(8080, config.api.port);
    }

    #[test]
    fn test_config_from_env() {
        temp_env::with_vars(
            [
                ("HELLO_WORLD_ENV_GREETING", Some("Alice")),
                ("hello_world_env_port", Some("9000")),
            ],
            || {
                let config = ConfigLoader::new("hello_world_env")
                    .with_search_dirs(vec![])
                    .load::<HelloConfig>()
                    .unwrap();
                assert_eq!("Alice", config.greeting);
                assert_eq!(9000, config.api.port);
            },
        );
    }
}
