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

//! Publishing to and subscribing from topics hosted in AMQP brokers such as RabbitMQ.
//!
//! Every topic maps to a `topic` exchange named after it.  Subscribers of a service share a
//! durable queue named `<service_name>.<topic_name>` so that each message is processed by only
//! one instance of the service.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

use chassis_core::clocks::{Clock, SystemClock};
use chassis_core::config::{Field, Kind, Schema, Settings, in_range};
use chassis_core::events::{
    EventError, EventResult, MessageHandler, MessageSchema, decode_message, stamp_message,
};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Delivery mode that asks the broker to persist messages.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Settings to connect to an AMQP broker.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AmqpConfig {
    /// Name of the service using the broker, used to name subscriber queues.
    pub service_name: String,

    /// Host where the broker runs.
    pub rabbitmq_host: String,

    /// Port where the broker listens.
    pub rabbitmq_port: u16,
}

impl Settings for AmqpConfig {
    fn schema() -> Schema {
        Schema::new()
            .field(
                Field::required("service_name", Kind::String)
                    .describe("Name of the service, used to name subscriber queues"),
            )
            .field(
                Field::with_default("rabbitmq_host", Kind::String, "rabbitmq")
                    .describe("Host where the AMQP broker runs"),
            )
            .field(
                Field::with_default("rabbitmq_port", Kind::Integer, 5672)
                    .describe("Port where the AMQP broker listens")
                    .check(in_range(1, 65535)),
            )
    }
}

impl AmqpConfig {
    /// Returns the URI to connect to the broker.
    pub fn uri(&self) -> String {
        format!("amqp://{}:{}/%2f", self.rabbitmq_host, self.rabbitmq_port)
    }
}

/// Converts a broker error into an event error.
fn map_lapin_error(e: lapin::Error) -> EventError {
    EventError::Backend(e.to_string())
}

/// What to tell the broker about a delivered message once processed.
#[derive(Debug, PartialEq)]
pub enum Disposition {
    /// The message was processed and can be discarded.
    Ack,

    /// The message was rejected and must not be redelivered.
    Reject,
}

/// Decodes and validates the message `body` delivered with `routing_key` and passes it to
/// `handler`, returning what to tell the broker about it.
///
/// Messages that are not valid JSON or that do not conform to `schema` never reach the handler.
pub async fn process_delivery<H: MessageHandler + ?Sized>(
    body: &[u8],
    routing_key: &str,
    schema: Option<&MessageSchema>,
    handler: &H,
) -> Disposition {
    info!("Message received with routing key {}", routing_key);

    let message = match decode_message(body, schema) {
        Ok(message) => message,
        Err(e) => {
            warn!("Rejecting message with routing key {}: {}", routing_key, e);
            return Disposition::Reject;
        }
    };

    match handler.handle(routing_key, message).await {
        Ok(()) => Disposition::Ack,
        Err(e) => {
            warn!("Handler failed to process message with routing key {}: {}", routing_key, e);
            Disposition::Reject
        }
    }
}

/// A topic in an AMQP broker.
pub struct AmqpTopic {
    /// URI to connect to the broker.
    uri: String,

    /// Name of the service that owns this client.
    service_name: String,

    /// Name of the topic, which is also the name of its exchange.
    topic_name: String,

    /// Schema that published and received messages must conform to, if any.
    schema: Option<MessageSchema>,

    /// Clock used to stamp published messages.
    clock: Arc<dyn Clock>,
}

impl AmqpTopic {
    /// Creates a client for `topic_name` on the broker described by `config`, optionally
    /// validating messages against `schema`.
    ///
    /// This does not connect to the broker: connections are opened on demand.
    pub fn new<S: Into<String>>(
        config: &AmqpConfig,
        topic_name: S,
        schema: Option<MessageSchema>,
    ) -> Self {
        Self {
            uri: config.uri(),
            service_name: config.service_name.clone(),
            topic_name: topic_name.into(),
            schema,
            clock: Arc::new(SystemClock::default()),
        }
    }

    /// Replaces the clock used to stamp published messages.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the name of the topic.
    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    /// Returns the name of the queue that subscribers of this service consume from.
    pub fn queue_name(&self) -> String {
        format!("{}.{}", self.service_name, self.topic_name)
    }

    /// Returns the key used to bind the subscriber queue to the topic exchange.
    pub fn binding_key(&self) -> String {
        format!("#.{}.#", self.topic_name)
    }

    /// Stamps `message`, validates it and serializes it for publication.
    pub fn prepare_message(&self, message: &Value) -> EventResult<Vec<u8>> {
        let message = stamp_message(message, self.clock.now_utc())?;
        if let Some(schema) = &self.schema {
            schema.validate(&message)?;
        }
        Ok(serde_json::to_vec(&message)?)
    }

    /// Opens a connection to the broker and declares the topic exchange in a new channel.
    async fn open_channel(&self) -> EventResult<(Connection, Channel)> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(map_lapin_error)?;
        let channel = connection.create_channel().await.map_err(map_lapin_error)?;
        channel
            .exchange_declare(
                &self.topic_name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)?;
        Ok((connection, channel))
    }

    /// Declares the subscriber queue of this service and binds it to the topic exchange.
    ///
    /// Returns the connection and the channel in which the queue was declared.  This is only
    /// useful on its own to create the queue before consuming from it, so that messages published
    /// in the meantime are not lost.
    pub async fn init_subscriber_queue(&self) -> EventResult<(Connection, Channel)> {
        let (connection, channel) = self.open_channel().await?;
        let queue_name = self.queue_name();
        channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)?;
        channel
            .queue_bind(
                &queue_name,
                &self.topic_name,
                &self.binding_key(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)?;
        Ok((connection, channel))
    }

    /// Publishes `message` to the topic and waits for the broker to confirm it.
    ///
    /// The message is stamped with the current time and must conform to the topic's schema.
    pub async fn publish(&self, message: &Value) -> EventResult<()> {
        let payload = self.prepare_message(message)?;

        let (connection, channel) = self.open_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_lapin_error)?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        let confirmation = channel
            .basic_publish(
                &self.topic_name,
                &self.topic_name,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(map_lapin_error)?
            .await
            .map_err(map_lapin_error)?;
        info!("Sent message to topic {}", self.topic_name);

        if let Err(e) = connection.close(200, "OK").await {
            warn!("Failed to close connection to the broker: {}", e);
        }

        if confirmation.is_nack() {
            return Err(EventError::Backend(format!(
                "Broker rejected message for topic {}",
                self.topic_name
            )));
        }
        Ok(())
    }

    /// Consumes messages from the topic and passes them to `handler`.
    ///
    /// Messages are processed one at a time.  Messages that cannot be decoded, that do not
    /// conform to the schema or that the handler fails to process are rejected without requeuing
    /// them.  If `run_forever` is false, returns after processing the first message.
    pub async fn subscribe<H: MessageHandler + ?Sized>(
        &self,
        handler: &H,
        run_forever: bool,
    ) -> EventResult<()> {
        let (connection, channel) = self.init_subscriber_queue().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await.map_err(map_lapin_error)?;
        let mut consumer = channel
            .basic_consume(
                &self.queue_name(),
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)?;

        info!("Waiting for messages in topic {}", self.topic_name);
        while let Some(delivery) = consumer.next().await {
            let delivery = delivery.map_err(map_lapin_error)?;
            let disposition = process_delivery(
                &delivery.data,
                delivery.routing_key.as_str(),
                self.schema.as_ref(),
                handler,
            )
            .await;
            match disposition {
                Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
                Disposition::Reject => {
                    delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await
                }
            }
            .map_err(map_lapin_error)?;

            if !run_forever {
                break;
            }
        }

        if let Err(e) = connection.close(200, "OK").await {
            warn!("Failed to close connection to the broker: {}", e);
        }
        Ok(())
    }
}

/// Test utilities for AMQP topics.
#[cfg(any(feature = "testutils", test))]
pub mod testutils {
    use super::*;
    use chassis_core::config::ConfigLoader;

    /// Loads the settings of the test broker from `AMQP_TEST_*` environment variables.
    ///
    /// Given that this is for testing purposes only, any errors will panic.
    pub fn setup() -> AmqpConfig {
        let _can_fail = env_logger::builder().is_test(true).try_init();

        ConfigLoader::new("AMQP_TEST").with_search_dirs(vec![]).load::<AmqpConfig>().unwrap()
    }
}
