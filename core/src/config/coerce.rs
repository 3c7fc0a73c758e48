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

//! Conversion of raw source values to the types declared by a schema.

use crate::config::schema::{Field, Kind, Requirement, Schema};
use crate::config::{FieldError, Origin};
use serde_json::{Map, Number, Value};

/// Parses a string as a boolean, accepting the usual spellings of truth values.
fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Describes the JSON type of `value` for error messages.
fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_owned(),
        Value::Bool(b) => format!("boolean {}", b),
        Value::Number(n) => format!("number {}", n),
        Value::String(s) => format!("string '{}'", s),
        Value::Array(_) => "list".to_owned(),
        Value::Object(_) => "mapping".to_owned(),
    }
}

/// Parses a string-encoded list or record, which must be written as JSON.
fn parse_json(s: &str) -> Option<Value> {
    serde_json::from_str(s.trim()).ok()
}

/// Coerces `value` to `kind`, recording failures under the field name `path`.
///
/// All errors found in nested lists and records are appended to `errors` so that a single pass
/// reports every problem.  Returns `None` if any error was found for this value.
pub(super) fn coerce(
    kind: &Kind,
    value: Value,
    path: &str,
    origin: &Origin,
    errors: &mut Vec<FieldError>,
) -> Option<Value> {
    let mismatch = |value: &Value, errors: &mut Vec<FieldError>| -> Option<Value> {
        errors.push(FieldError::TypeMismatch {
            field: path.to_owned(),
            origin: origin.clone(),
            expected: kind.to_string(),
            actual: describe(value),
        });
        None
    };

    match (kind, value) {
        (Kind::String, Value::String(s)) => Some(Value::String(s)),
        (Kind::String, Value::Number(n)) => Some(Value::String(n.to_string())),
        (Kind::String, Value::Bool(b)) => Some(Value::String(b.to_string())),

        (Kind::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Some(Value::Number(n)),
        (Kind::Integer, Value::String(s)) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                Some(Value::from(i))
            } else if let Ok(u) = trimmed.parse::<u64>() {
                Some(Value::from(u))
            } else {
                mismatch(&Value::String(s), errors)
            }
        }

        (Kind::Float, Value::Number(n)) => Some(Value::Number(n)),
        (Kind::Float, Value::String(s)) => {
            match s.trim().parse::<f64>().ok().and_then(Number::from_f64) {
                Some(n) => Some(Value::Number(n)),
                None => mismatch(&Value::String(s), errors),
            }
        }

        (Kind::Boolean, Value::Bool(b)) => Some(Value::Bool(b)),
        (Kind::Boolean, Value::Number(n)) if n.as_u64() == Some(0) || n.as_u64() == Some(1) => {
            Some(Value::Bool(n.as_u64() == Some(1)))
        }
        (Kind::Boolean, Value::String(s)) => match parse_bool(&s) {
            Some(b) => Some(Value::Bool(b)),
            None => mismatch(&Value::String(s), errors),
        },

        (Kind::List(inner), Value::Array(items)) => {
            let before = errors.len();
            let mut coerced = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                let item_path = format!("{}[{}]", path, i);
                if let Some(item) = coerce(inner, item, &item_path, origin, errors) {
                    coerced.push(item);
                }
            }
            if errors.len() == before { Some(Value::Array(coerced)) } else { None }
        }

        (Kind::Record(schema), Value::Object(map)) => {
            let before = errors.len();
            let record = resolve_record(schema, map, path, origin, errors);
            if errors.len() == before { Some(Value::Object(record)) } else { None }
        }

        (Kind::List(_), Value::String(s)) | (Kind::Record(_), Value::String(s)) => {
            match parse_json(&s) {
                Some(parsed @ (Value::Array(_) | Value::Object(_))) => {
                    coerce(kind, parsed, path, origin, errors)
                }
                _ => mismatch(&Value::String(s), errors),
            }
        }

        (_, value) => mismatch(&value, errors),
    }
}

/// Coerces an already-selected `value` for `field` and runs its custom checks.
///
/// `path` is the fully-qualified name of the field used in error reports.
pub(super) fn coerce_field(
    field: &Field,
    value: Value,
    path: &str,
    origin: &Origin,
    errors: &mut Vec<FieldError>,
) -> Option<Value> {
    // An explicit null clears the value, which only optional fields accept.
    if value.is_null() {
        if *field.requirement() == Requirement::Optional {
            return Some(Value::Null);
        }
        errors.push(FieldError::Missing { field: path.to_owned() });
        return None;
    }

    let value = coerce(field.kind(), value, path, origin, errors)?;
    match field.run_checks(&value) {
        Ok(()) => Some(value),
        Err(detail) => {
            errors.push(FieldError::Invalid {
                field: path.to_owned(),
                origin: origin.clone(),
                detail,
            });
            None
        }
    }
}

/// Resolves the fields of a nested record provided as a whole by a single source.
///
/// Missing nested fields take their declared defaults.  Keys not declared in `schema` are dropped.
fn resolve_record(
    schema: &Schema,
    mut map: Map<String, Value>,
    path: &str,
    origin: &Origin,
    errors: &mut Vec<FieldError>,
) -> Map<String, Value> {
    let mut record = Map::new();
    for field in schema.fields() {
        let field_path = format!("{}.{}", path, field.name());
        let (value, field_origin) = match (map.remove(field.name()), field.requirement()) {
            (Some(value), _) => (value, origin.clone()),
            (None, Requirement::Default(value)) => (value.clone(), Origin::Default),
            (None, Requirement::Optional) => (Value::Null, Origin::Default),
            (None, Requirement::Required) => {
                errors.push(FieldError::Missing { field: field_path });
                continue;
            }
        };
        if let Some(value) = coerce_field(field, value, &field_path, &field_origin, errors) {
            record.insert(field.name().to_owned(), value);
        }
    }
    for key in map.keys() {
        log::debug!("Ignoring undeclared key {}.{} in {}", path, key, origin);
    }
    record
}
