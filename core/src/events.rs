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

//! Broker-independent handling of event messages.
//!
//! Messages are JSON objects that can be validated against a JSON Schema.  Publishers stamp each
//! message with the time at which it was sent.

use async_trait::async_trait;
use derivative::Derivative;
use serde_json::Value;
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Name of the field that `stamp_message` adds to messages.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Event processing errors.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum EventError {
    /// Indicates that a JSON Schema could not be compiled.
    #[error("Invalid JSON schema: {0}")]
    InvalidSchema(String),

    /// Indicates that a message does not conform to its schema.  Holds every violation.
    #[error("Message does not conform to schema: {}", .0.join("; "))]
    InvalidMessage(Vec<String>),

    /// Indicates that a message is not a JSON object.
    #[error("Message is not a JSON object")]
    NotAnObject,

    /// Indicates that a message could not be encoded or decoded.
    #[error("Cannot process message payload: {0}")]
    Serialization(String),

    /// Catch-all error for failures reported by the message broker.
    #[error("Broker error: {0}")]
    Backend(String),

    /// Indicates that no schema was registered for an event type.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

impl From<serde_json::Error> for EventError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// Result type for this module.
pub type EventResult<T> = Result<T, EventError>;

/// A compiled JSON Schema to validate messages against.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct MessageSchema {
    /// The schema document as given by the caller.
    schema: Value,

    /// The compiled form of `schema`.
    #[derivative(Debug = "ignore")]
    validator: Arc<jsonschema::Validator>,
}

impl MessageSchema {
    /// Compiles the JSON Schema document `schema`.
    pub fn new(schema: Value) -> EventResult<Self> {
        let validator = jsonschema::Validator::new(&schema)
            .map_err(|e| EventError::InvalidSchema(e.to_string()))?;
        Ok(Self { schema, validator: Arc::new(validator) })
    }

    /// Returns the schema document.
    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Validates `message` against the schema and reports every violation found.
    pub fn validate(&self, message: &Value) -> EventResult<()> {
        let errors = self
            .validator
            .iter_errors(message)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() { e.to_string() } else { format!("{}: {}", path, e) }
            })
            .collect::<Vec<String>>();
        if errors.is_empty() { Ok(()) } else { Err(EventError::InvalidMessage(errors)) }
    }
}

/// Returns a copy of the JSON object `message` with its timestamp field set to `now`.
pub fn stamp_message(message: &Value, now: OffsetDateTime) -> EventResult<Value> {
    let Value::Object(fields) = message else {
        return Err(EventError::NotAnObject);
    };

    let timestamp = now
        .to_offset(time::UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|e| EventError::Serialization(e.to_string()))?;

    let mut fields = fields.clone();
    fields.insert(TIMESTAMP_FIELD.to_owned(), Value::String(timestamp));
    Ok(Value::Object(fields))
}

/// Parses a raw message `body` received from a broker and validates it against `schema`, if any.
pub fn decode_message(body: &[u8], schema: Option<&MessageSchema>) -> EventResult<Value> {
    let message = serde_json::from_slice::<Value>(body)?;
    if let Some(schema) = schema {
        schema.validate(&message)?;
    }
    Ok(message)
}

/// Consumer of messages delivered by a topic subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one `message` that was delivered with `key`.
    ///
    /// The key is the event type for Kafka topics and the routing key for AMQP topics.  Returning
    /// an error rejects the message.
    async fn handle(&self, key: &str, message: Value) -> Result<(), String>;
}

/// Test utilities for message consumers.
#[cfg(any(test, feature = "testutils"))]
pub mod testutils {
    use super::*;
    use std::sync::Mutex;

    /// Handler that records all messages it receives and optionally rejects them.
    #[derive(Default)]
    pub struct RecordingHandler {
        /// Messages received so far along with their keys.
        messages: Mutex<Vec<(String, Value)>>,

        /// Error to return from `handle`, if any.
        error: Option<String>,
    }

    impl RecordingHandler {
        /// Creates a handler that rejects every message with `error`.
        pub fn failing<S: Into<String>>(error: S) -> Self {
            Self { error: Some(error.into()), ..Default::default() }
        }

        /// Returns the messages received so far.
        pub fn messages(&self) -> Vec<(String, Value)> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, key: &str, message: Value) -> Result<(), String> {
            self.messages.lock().unwrap().push((key.to_owned(), message));
            match &self.error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutils::*;
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    fn greeting_schema() -> MessageSchema {
        MessageSchema::new(json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "count": { "type": "integer", "minimum": 0 },
            },
            "required": ["name", "count"],
        }))
        .unwrap()
    }

    #[test]
    fn test_message_schema_invalid() {
        match MessageSchema::new(json!({"type": "not-a-type"})).unwrap_err() {
            EventError::InvalidSchema(_) => (),
            e => panic!("Unexpected error {:?}", e),
        }
    }

    #[test]
    fn test_message_schema_validate_ok() {
        greeting_schema().validate(&json!({"name": "Alice", "count": 3})).unwrap();
    }

    #[test]
    fn test_message_schema_validate_reports_all_errors() {
        let err = greeting_schema().validate(&json!({"name": 5, "count": -1})).unwrap_err();
        match err {
            EventError::InvalidMessage(errors) => {
                assert_eq!(2, errors.len(), "Got {:?}", errors);
                assert!(errors.iter().any(|e| e.starts_with("/name: ")), "Got {:?}", errors);
                assert!(errors.iter().any(|e| e.starts_with("/count: ")), "Got {:?}", errors);
            }
            e => panic!("Unexpected error {:?}", e),
        }
    }

    #[test]
    fn test_stamp_message() {
        let message = json!({"name": "Alice", "timestamp": "old"});
        let stamped = stamp_message(&message, datetime!(2023-05-01 12:30:15.25 UTC)).unwrap();
        assert_eq!(json!({"name": "Alice", "timestamp": "2023-05-01T12:30:15.25Z"}), stamped);
        assert_eq!("old", message["timestamp"]);
    }

    #[test]
    fn test_stamp_message_converts_to_utc() {
        let stamped = stamp_message(&json!({}), datetime!(2023-05-01 14:00:00 +2)).unwrap();
        assert_eq!(json!({"timestamp": "2023-05-01T12:00:00Z"}), stamped);
    }

    #[test]
    fn test_stamp_message_not_an_object() {
        let now = datetime!(2023-05-01 12:00:00 UTC);
        assert_eq!(EventError::NotAnObject, stamp_message(&json!([1, 2]), now).unwrap_err());
        assert_eq!(EventError::NotAnObject, stamp_message(&json!("text"), now).unwrap_err());
    }

    #[test]
    fn test_decode_message() {
        let schema = greeting_schema();
        assert_eq!(
            json!({"name": "Bob", "count": 0}),
            decode_message(br#"{"name": "Bob", "count": 0}"#, Some(&schema)).unwrap()
        );
        assert_eq!(json!([1]), decode_message(b"[1]", None).unwrap());

        match decode_message(b"{not json", Some(&schema)).unwrap_err() {
            EventError::Serialization(_) => (),
            e => panic!("Unexpected error {:?}", e),
        }
        match decode_message(br#"{"name": "Bob"}"#, Some(&schema)).unwrap_err() {
            EventError::InvalidMessage(errors) => assert_eq!(1, errors.len()),
            e => panic!("Unexpected error {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_recording_handler() {
        let handler = RecordingHandler::default();
        handler.handle("greetings", json!({"a": 1})).await.unwrap();
        assert_eq!(vec![("greetings".to_owned(), json!({"a": 1}))], handler.messages());

        let handler = RecordingHandler::failing("boom");
        assert_eq!("boom", handler.handle("k", json!({})).await.unwrap_err());
        assert_eq!(1, handler.messages().len());
    }
}
