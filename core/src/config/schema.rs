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

//! Declarations of the fields that make up a settings type.

use derivative::Derivative;
use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::Arc;

/// Custom validation hook for a field, invoked with the already-coerced value.
pub type Check = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Type of the values a field accepts.
#[derive(Clone, Debug)]
pub enum Kind {
    /// A UTF-8 string.
    String,

    /// A signed or unsigned integer.
    Integer,

    /// A floating point number.
    Float,

    /// A boolean.
    Boolean,

    /// A homogeneous list of values of the given kind.
    List(Box<Kind>),

    /// A nested record with its own fields.
    Record(Schema),
}

impl Kind {
    /// Shorthand to create a `Kind::List` of `inner` values.
    pub fn list_of(inner: Kind) -> Self {
        Kind::List(Box::from(inner))
    }

    /// Renders this kind as a JSON Schema fragment.
    fn json_schema(&self) -> Value {
        match self {
            Kind::String => json!({"type": "string"}),
            Kind::Integer => json!({"type": "integer"}),
            Kind::Float => json!({"type": "number"}),
            Kind::Boolean => json!({"type": "boolean"}),
            Kind::List(inner) => json!({"type": "array", "items": inner.json_schema()}),
            Kind::Record(schema) => schema.json_schema(),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::String => write!(f, "string"),
            Kind::Integer => write!(f, "integer"),
            Kind::Float => write!(f, "float"),
            Kind::Boolean => write!(f, "boolean"),
            Kind::List(inner) => write!(f, "list of {}", inner),
            Kind::Record(_) => write!(f, "record"),
        }
    }
}

/// Whether a field must be provided by some source.
#[derive(Clone, Debug, PartialEq)]
pub enum Requirement {
    /// No default exists and some source must provide a value.
    Required,

    /// The given value is used when no source provides one.
    Default(Value),

    /// The field is nullable and defaults to null.
    Optional,
}

/// Declaration of a single configuration field.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct Field {
    /// Name of the field as it appears in YAML keys and in environment variable suffixes.
    name: String,

    /// Type of the values accepted by the field.
    kind: Kind,

    /// Whether the field needs a value.
    requirement: Requirement,

    /// Human-readable explanation of the field, used in generated documentation.
    description: Option<String>,

    /// Extra validations to apply to non-null values once coerced to `kind`.
    #[derivative(Debug = "ignore")]
    checks: Vec<Check>,
}

impl Field {
    /// Creates a field of type `kind` that has no default value.
    pub fn required<N: Into<String>>(name: N, kind: Kind) -> Self {
        Self::new(name.into(), kind, Requirement::Required)
    }

    /// Creates a field of type `kind` that takes `default` when no source provides it.
    pub fn with_default<N: Into<String>, V: Into<Value>>(name: N, kind: Kind, default: V) -> Self {
        Self::new(name.into(), kind, Requirement::Default(default.into()))
    }

    /// Creates a nullable field of type `kind` that defaults to null.
    pub fn optional<N: Into<String>>(name: N, kind: Kind) -> Self {
        Self::new(name.into(), kind, Requirement::Optional)
    }

    /// Common constructor for all field types.
    fn new(name: String, kind: Kind, requirement: Requirement) -> Self {
        Self { name, kind, requirement, description: None, checks: vec![] }
    }

    /// Attaches a human-readable `description` to the field.
    pub fn describe<D: Into<String>>(mut self, description: D) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds a custom validation `check` to the field.
    pub fn check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.checks.push(Arc::from(check));
        self
    }

    /// Gets the name of the field.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the kind of the field.
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// Gets the requirement of the field.
    pub fn requirement(&self) -> &Requirement {
        &self.requirement
    }

    /// Gets the description of the field, if any.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Runs all custom checks against `value` and returns the first failure.
    pub(super) fn run_checks(&self, value: &Value) -> Result<(), String> {
        for check in &self.checks {
            check(value)?;
        }
        Ok(())
    }
}

/// Ordered collection of field declarations.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    /// The fields in declaration order.  Names are unique.
    fields: Vec<Field>,
}

impl Schema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `field` to the schema.
    ///
    /// If a field with the same name already exists, it is replaced in place.  This allows a
    /// settings type that extends another one to override the defaults of the inherited fields.
    pub fn field(mut self, field: Field) -> Self {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
        self
    }

    /// Adds all fields of `other` to this schema, with the same semantics as `field`.
    pub fn extend(self, other: Schema) -> Self {
        other.fields.into_iter().fold(self, Schema::field)
    }

    /// Returns the fields of the schema in declaration order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Looks up a field by `name`.
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Renders the schema as a JSON Schema document describing a settings object.
    pub fn json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = vec![];
        for field in &self.fields {
            let mut property = field.kind.json_schema();
            if let Value::Object(ref mut property) = property {
                if let Some(description) = &field.description {
                    property.insert("description".to_owned(), Value::from(description.as_str()));
                }
                match &field.requirement {
                    Requirement::Required => required.push(Value::from(field.name.as_str())),
                    Requirement::Default(value) => {
                        property.insert("default".to_owned(), value.clone());
                    }
                    Requirement::Optional => {
                        property.insert("default".to_owned(), Value::Null);
                    }
                }
            }
            if field.requirement == Requirement::Optional {
                property = json!({"anyOf": [property, {"type": "null"}]});
            }
            properties.insert(field.name.clone(), property);
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Returns a check that only accepts strings in `choices`.
pub fn one_of(choices: &'static [&'static str]) -> impl Fn(&Value) -> Result<(), String> {
    move |value| match value.as_str() {
        Some(s) if choices.contains(&s) => Ok(()),
        _ => Err(format!("must be one of {}", choices.join(", "))),
    }
}

/// Returns a check that only accepts strings starting with `prefix`.
pub fn starts_with(prefix: &'static str) -> impl Fn(&Value) -> Result<(), String> {
    move |value| match value.as_str() {
        Some(s) if s.starts_with(prefix) => Ok(()),
        _ => Err(format!("must start with {}", prefix)),
    }
}

/// Returns a check that only accepts integers in the `[min, max]` range.
pub fn in_range(min: i64, max: i64) -> impl Fn(&Value) -> Result<(), String> {
    move |value| match value.as_i64() {
        Some(i) if i >= min && i <= max => Ok(()),
        _ => Err(format!("must be in the range [{}, {}]", min, max)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_field_replaces_existing() {
        let schema = Schema::new()
            .field(Field::required("a", Kind::String))
            .field(Field::required("b", Kind::Integer))
            .field(Field::with_default("a", Kind::String, "x"));
        let names = schema.fields().iter().map(Field::name).collect::<Vec<&str>>();
        assert_eq!(vec!["a", "b"], names);
        assert_eq!(&Requirement::Default(json!("x")), schema.get("a").unwrap().requirement());
    }

    #[test]
    fn test_schema_extend_keeps_order() {
        let base = Schema::new()
            .field(Field::required("host", Kind::String))
            .field(Field::with_default("port", Kind::Integer, 8080));
        let schema = base.extend(
            Schema::new()
                .field(Field::with_default("greeting", Kind::String, "World"))
                .field(Field::with_default("port", Kind::Integer, 9090)),
        );
        let names = schema.fields().iter().map(Field::name).collect::<Vec<&str>>();
        assert_eq!(vec!["host", "port", "greeting"], names);
        assert_eq!(&Requirement::Default(json!(9090)), schema.get("port").unwrap().requirement());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!("list of integer", Kind::list_of(Kind::Integer).to_string());
        assert_eq!("record", Kind::Record(Schema::new()).to_string());
    }

    #[test]
    fn test_checks() {
        let check = one_of(&["a", "b"]);
        assert!(check(&json!("a")).is_ok());
        assert_eq!("must be one of a, b", check(&json!("c")).unwrap_err());

        let check = starts_with("postgresql://");
        assert!(check(&json!("postgresql://localhost")).is_ok());
        assert!(check(&json!("mysql://localhost")).is_err());

        let check = in_range(1, 65535);
        assert!(check(&json!(1)).is_ok());
        assert!(check(&json!(65535)).is_ok());
        assert!(check(&json!(0)).is_err());
        assert!(check(&json!(65536)).is_err());
    }

    #[test]
    fn test_json_schema() {
        let schema = Schema::new()
            .field(Field::required("name", Kind::String).describe("The name"))
            .field(Field::with_default("count", Kind::Integer, 3))
            .field(Field::optional("tags", Kind::list_of(Kind::String)));
        assert_eq!(
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "The name"},
                    "count": {"type": "integer", "default": 3},
                    "tags": {"anyOf": [
                        {"type": "array", "items": {"type": "string"}, "default": null},
                        {"type": "null"},
                    ]},
                },
                "required": ["name"],
            }),
            schema.json_schema()
        );
    }
}
