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

//! Common utilities to interact with a MongoDB database.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

use chassis_core::config::{Field, Kind, Schema, Settings, starts_with};
use derivative::Derivative;
use log::info;
use mongodb::error::ErrorKind;
use mongodb::{Client, Collection, Database};
use serde::Deserialize;

/// MongoDB errors.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MongoError {
    /// Indicates that the connection URL could not be parsed.
    #[error("Invalid db_url: {0}")]
    InvalidUrl(String),

    /// Catch-all error for problems reported by the driver, such as failed DNS lookups.
    #[error("MongoDB error: {0}")]
    Backend(String),
}

/// Classifies a driver error raised while creating a client.
fn map_client_error(e: mongodb::error::Error) -> MongoError {
    match *e.kind {
        ErrorKind::InvalidArgument { .. } => MongoError::InvalidUrl(e.to_string()),
        _ => MongoError::Backend(e.to_string()),
    }
}

/// Result type for this module.
pub type MongoResult<T> = Result<T, MongoError>;

/// Settings to establish a connection to a MongoDB database.
#[derive(Clone, Deserialize, Derivative)]
#[derivative(Debug, PartialEq)]
pub struct MongoConfig {
    /// URL of the MongoDB deployment, including credentials.
    #[derivative(Debug = "ignore")]
    pub db_url: String,

    /// Name of the database to use.
    pub db_name: String,
}

impl Settings for MongoConfig {
    fn schema() -> Schema {
        Schema::new()
            .field(
                Field::required("db_url", Kind::String)
                    .describe("URL to a MongoDB deployment")
                    .check(starts_with("mongodb")),
            )
            .field(
                Field::required("db_name", Kind::String).describe("Name of the database to use"),
            )
    }
}

/// Handle to a MongoDB database.
#[derive(Clone)]
pub struct MongoConnector {
    /// Client connected to the deployment.  Clones share the same connection pool.
    client: Client,

    /// Name of the database to operate on.
    db_name: String,
}

impl MongoConnector {
    /// Creates a new client based on `config`.
    ///
    /// Note that this only parses the settings: connections are established on first use.
    pub async fn connect(config: &MongoConfig) -> MongoResult<Self> {
        let client = Client::with_uri_str(&config.db_url).await.map_err(map_client_error)?;
        info!("Configured MongoDB client for database {}", config.db_name);
        Ok(Self { client, db_name: config.db_name.clone() })
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Returns the configured database.
    pub fn database(&self) -> Database {
        self.client.database(&self.db_name)
    }

    /// Returns the collection `name` in the configured database with documents of type `T`.
    pub fn get_collection<T: Send + Sync>(&self, name: &str) -> Collection<T> {
        self.database().collection::<T>(name)
    }

    /// Shuts down the client, waiting for in-flight operations to complete.
    pub async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

/// Test utilities for the MongoDB connection.
#[cfg(any(feature = "testutils", test))]
pub mod testutils {
    use super::*;
    use chassis_core::config::ConfigLoader;

    /// Creates a new connection to the test database, loading its settings from `MONGO_TEST_*`
    /// environment variables.
    ///
    /// Given that this is for testing purposes only, any errors will panic.
    pub async fn setup() -> MongoConnector {
        let _can_fail = env_logger::builder().is_test(true).try_init();

        let config = ConfigLoader::new("MONGO_TEST")
            .with_search_dirs(vec![])
            .load::<MongoConfig>()
            .unwrap();
        MongoConnector::connect(&config).await.unwrap()
    }
}
