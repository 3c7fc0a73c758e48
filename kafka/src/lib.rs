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

//! Publishing to and subscribing from Kafka topics.
//!
//! Events are records whose key names the event type and whose payload is a JSON document.  A
//! topic may carry several event types, each with its own schema.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

use chassis_core::config::{Field, Kind, Schema, Settings};
use chassis_core::events::{
    EventError, EventResult, MessageHandler, MessageSchema, decode_message,
};
use log::{info, warn};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Maximum time to wait for the broker to acknowledge a published event.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings to connect to a Kafka cluster.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct KafkaConfig {
    /// Name of the service using the cluster, used as the consumer group.
    pub service_name: String,

    /// Suffix to distinguish the clients of different instances of the same service.
    pub client_suffix: String,

    /// Bootstrap servers as `host:port` pairs.
    pub kafka_servers: Vec<String>,
}

impl Settings for KafkaConfig {
    fn schema() -> Schema {
        Schema::new()
            .field(
                Field::required("service_name", Kind::String)
                    .describe("Name of the service, used as the consumer group"),
            )
            .field(
                Field::required("client_suffix", Kind::String)
                    .describe("Suffix to identify the clients of this service instance"),
            )
            .field(
                Field::required("kafka_servers", Kind::list_of(Kind::String))
                    .describe("Bootstrap servers as host:port pairs")
                    .check(|value| match value.as_array() {
                        Some(servers) if !servers.is_empty() => Ok(()),
                        _ => Err("must contain at least one server".to_owned()),
                    }),
            )
    }
}

impl KafkaConfig {
    /// Returns the client identifier to present to the cluster.
    pub fn client_id(&self) -> String {
        format!("{}.{}", self.service_name, self.client_suffix)
    }

    /// Returns the base client configuration to connect to the cluster.
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.kafka_servers.join(","))
            .set("client.id", self.client_id());
        config
    }
}

/// Converts a Kafka error into an event error.
fn map_kafka_error(e: KafkaError) -> EventError {
    EventError::Backend(e.to_string())
}

/// A Kafka topic.
pub struct KafkaTopic {
    /// Settings of the cluster that hosts the topic.
    config: KafkaConfig,

    /// Name of the topic.
    topic_name: String,

    /// Schemas of the events carried by the topic keyed by event type.  If empty, events are not
    /// validated.
    schemas: HashMap<String, MessageSchema>,

    /// Producer used to publish events.
    producer: FutureProducer,
}

impl KafkaTopic {
    /// Creates a client for `topic_name` on the cluster described by `config`.
    ///
    /// `schemas` maps event types to the schemas their payloads must conform to.  When not
    /// empty, only the event types it names can be published.
    pub fn new<S: Into<String>>(
        config: &KafkaConfig,
        topic_name: S,
        schemas: HashMap<String, MessageSchema>,
    ) -> EventResult<Self> {
        let producer =
            config.client_config().create::<FutureProducer>().map_err(map_kafka_error)?;
        Ok(Self { config: config.clone(), topic_name: topic_name.into(), schemas, producer })
    }

    /// Returns the name of the topic.
    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    /// Validates the `value` of an event of type `key` and serializes it for publication.
    pub fn prepare_event(&self, key: &str, value: &Value) -> EventResult<Vec<u8>> {
        if !self.schemas.is_empty() {
            match self.schemas.get(key) {
                Some(schema) => schema.validate(value)?,
                None => return Err(EventError::UnknownEventType(key.to_owned())),
            }
        }
        Ok(serde_json::to_vec(value)?)
    }

    /// Decodes a received record with `key` and `payload` into its event type and value.
    ///
    /// Values are validated against the schema of their event type when one is registered.
    pub fn decode_event(
        &self,
        key: Option<&[u8]>,
        payload: Option<&[u8]>,
    ) -> EventResult<(String, Value)> {
        let key = match key {
            Some(key) => String::from_utf8(key.to_vec())
                .map_err(|e| EventError::Serialization(format!("Invalid event key: {}", e)))?,
            None => return Err(EventError::Serialization("Missing event key".to_owned())),
        };

        let schema = if self.schemas.is_empty() {
            None
        } else {
            match self.schemas.get(&key) {
                Some(schema) => Some(schema),
                None => return Err(EventError::UnknownEventType(key)),
            }
        };

        let value = decode_message(payload.unwrap_or_default(), schema)?;
        Ok((key, value))
    }

    /// Publishes an event of type `key` with `value` to the topic and waits for the cluster to
    /// acknowledge it.
    pub async fn publish(&self, key: &str, value: &Value) -> EventResult<()> {
        let payload = self.prepare_event(key, value)?;
        let record = FutureRecord::to(&self.topic_name).key(key).payload(&payload);
        self.producer.send(record, PUBLISH_TIMEOUT).await.map_err(|(e, _)| map_kafka_error(e))?;
        info!("Sent event {} to topic {}", key, self.topic_name);
        Ok(())
    }

    /// Consumes events from the topic and passes them to `handler`.
    ///
    /// Events that cannot be decoded or that the handler fails to process are logged and
    /// skipped.  If `run_forever` is false, returns after processing the first event.
    pub async fn subscribe<H: MessageHandler + ?Sized>(
        &self,
        handler: &H,
        run_forever: bool,
    ) -> EventResult<()> {
        let consumer = self
            .config
            .client_config()
            .set("group.id", &self.config.service_name)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .create::<StreamConsumer>()
            .map_err(map_kafka_error)?;
        consumer.subscribe(&[self.topic_name.as_str()]).map_err(map_kafka_error)?;

        info!("Waiting for events in topic {}", self.topic_name);
        loop {
            let record = consumer.recv().await.map_err(map_kafka_error)?;
            match self.decode_event(record.key(), record.payload()) {
                Ok((key, value)) => {
                    info!("Event {} received from topic {}", key, self.topic_name);
                    if let Err(e) = handler.handle(&key, value).await {
                        warn!("Handler failed to process event {}: {}", key, e);
                    }
                }
                Err(e) => warn!("Skipping event from topic {}: {}", self.topic_name, e),
            }
            consumer.commit_message(&record, CommitMode::Async).map_err(map_kafka_error)?;

            if !run_forever {
                break;
            }
        }
        Ok(())
    }
}

/// Test utilities for Kafka topics.
#[cfg(any(feature = "testutils", test))]
pub mod testutils {
    use super::*;
    use chassis_core::config::ConfigLoader;

    /// Loads the settings of the test cluster from `KAFKA_TEST_*` environment variables.
    ///
    /// Given that this is for testing purposes only, any errors will panic.
    pub fn setup() -> KafkaConfig {
        let _can_fail = env_logger::builder().is_test(true).try_init();

        ConfigLoader::new("KAFKA_TEST").with_search_dirs(vec![]).load::<KafkaConfig>().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chassis_core::config::ConfigLoader;
    use chassis_core::events::testutils::RecordingHandler;
    use serde_json::json;

    fn test_config() -> KafkaConfig {
        KafkaConfig {
            service_name: "my_service".to_owned(),
            client_suffix: "1".to_owned(),
            kafka_servers: vec!["localhost:9092".to_owned()],
        }
    }

    fn test_schemas() -> HashMap<String, MessageSchema> {
        let schema = MessageSchema::new(json!({
            "type": "object",
            "properties": { "file_id": { "type": "string" } },
            "required": ["file_id"],
        }))
        .unwrap();
        HashMap::from([("file_registered".to_owned(), schema)])
    }

    #[test]
    fn test_kafka_config_from_env() {
        temp_env::with_vars(
            [
                ("KAFKA_UNIT_SERVICE_NAME", Some("svc")),
                ("KAFKA_UNIT_CLIENT_SUFFIX", Some("a")),
                ("KAFKA_UNIT_KAFKA_SERVERS", Some(r#"["k1:9092", "k2:9092"]"#)),
            ],
            || {
                let config = ConfigLoader::new("kafka_unit")
                    .with_search_dirs(vec![])
                    .load::<KafkaConfig>()
                    .unwrap();
                assert_eq!(vec!["k1:9092".to_owned(), "k2:9092".to_owned()], config.kafka_servers);
                assert_eq!("svc.a", config.client_id());
            },
        );
    }

    #[test]
    fn test_kafka_config_errors() {
        temp_env::with_vars(
            [
                ("KAFKA_BAD_SERVICE_NAME", Some("svc")),
                ("KAFKA_BAD_KAFKA_SERVERS", Some("[]")),
            ],
            || {
                let err = ConfigLoader::new("kafka_bad")
                    .with_search_dirs(vec![])
                    .load::<KafkaConfig>()
                    .unwrap_err();
                let fields = err.field_errors().iter().map(|e| e.field()).collect::<Vec<&str>>();
                assert_eq!(vec!["client_suffix", "kafka_servers"], fields);
            },
        );
    }

    #[test]
    fn test_prepare_event() {
        let topic = KafkaTopic::new(&test_config(), "files", test_schemas()).unwrap();
        assert_eq!("files", topic.topic_name());

        let payload = topic.prepare_event("file_registered", &json!({"file_id": "f1"})).unwrap();
        assert_eq!(json!({"file_id": "f1"}), serde_json::from_slice::<Value>(&payload).unwrap());

        match topic.prepare_event("file_registered", &json!({"file_id": 1})).unwrap_err() {
            EventError::InvalidMessage(_) => (),
            e => panic!("Unexpected error {:?}", e),
        }
        assert_eq!(
            EventError::UnknownEventType("file_deleted".to_owned()),
            topic.prepare_event("file_deleted", &json!({})).unwrap_err()
        );
    }

    #[test]
    fn test_prepare_event_without_schemas() {
        let topic = KafkaTopic::new(&test_config(), "files", HashMap::default()).unwrap();
        topic.prepare_event("anything", &json!([1, 2, 3])).unwrap();
    }

    #[test]
    fn test_decode_event() {
        let topic = KafkaTopic::new(&test_config(), "files", test_schemas()).unwrap();
        assert_eq!(
            ("file_registered".to_owned(), json!({"file_id": "f1"})),
            topic.decode_event(Some(b"file_registered"), Some(br#"{"file_id": "f1"}"#)).unwrap()
        );

        match topic.decode_event(None, Some(b"{}")).unwrap_err() {
            EventError::Serialization(message) => assert_eq!("Missing event key", message),
            e => panic!("Unexpected error {:?}", e),
        }
        assert_eq!(
            EventError::UnknownEventType("other".to_owned()),
            topic.decode_event(Some(b"other"), Some(b"{}")).unwrap_err()
        );
        match topic.decode_event(Some(b"file_registered"), Some(b"{}")).unwrap_err() {
            EventError::InvalidMessage(_) => (),
            e => panic!("Unexpected error {:?}", e),
        }
        match topic.decode_event(Some(b"file_registered"), None).unwrap_err() {
            EventError::Serialization(_) => (),
            e => panic!("Unexpected error {:?}", e),
        }
    }

    #[tokio::test]
    #[ignore = "Requires environment configuration and is expensive"]
    async fn test_publish_and_subscribe() {
        let config = testutils::setup();
        let topic_name = format!("test_{}", uuid::Uuid::new_v4().simple());
        let topic = KafkaTopic::new(&config, topic_name, test_schemas()).unwrap();

        topic.publish("file_registered", &json!({"file_id": "f1"})).await.unwrap();

        let handler = RecordingHandler::default();
        topic.subscribe(&handler, false).await.unwrap();
        assert_eq!(
            vec![("file_registered".to_owned(), json!({"file_id": "f1"}))],
            handler.messages()
        );
    }
}
