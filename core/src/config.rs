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

//! Typed configuration loading from layered sources.
//!
//! A service describes its configuration with a type that implements `Settings`.  The
//! `ConfigLoader` then gathers values for every declared field from the following sources, where
//! each source overrides the ones before it:
//!
//! 1.  The defaults declared in the schema.
//! 1.  A YAML file, either given explicitly or found as `.<prefix>.yaml` in the current directory
//!     or in the home directory.
//! 1.  A secrets directory, if configured, with one file per field named `<prefix>_<field>`.
//! 1.  Environment variables named `<prefix>_<field>`, matched case-insensitively.
//! 1.  Explicit overrides passed to the loader.
//!
//! Every field is then coerced to its declared type and validated.  Validation does not stop at
//! the first problem: the returned `ConfigError::Invalid` lists every field that failed.

use crate::env;
use log::{debug, info};
use serde::Deserialize;
use serde::de::value::{MapAccessDeserializer, StringDeserializer};
use serde::de::{self, DeserializeOwned, DeserializeSeed, MapAccess};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

mod coerce;
mod schema;
pub use schema::{Check, Field, Kind, Requirement, Schema, in_range, one_of, starts_with};

/// Prefix to use for environment variables and the default YAML file when none is specified.
pub const DEFAULT_CONFIG_PREFIX: &str = "chassis";

/// Place where a configuration value came from.
#[derive(Clone, Debug, PartialEq)]
pub enum Origin {
    /// The default declared in the schema.
    Default,

    /// The YAML file at the given path.
    Yaml(PathBuf),

    /// The secret file at the given path.
    Secret(PathBuf),

    /// The environment variable with the given name.
    Env(String),

    /// An override given to the loader.
    Override,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Default => write!(f, "default value"),
            Origin::Yaml(path) => write!(f, "YAML file {}", path.display()),
            Origin::Secret(path) => write!(f, "secret file {}", path.display()),
            Origin::Env(name) => write!(f, "environment variable {}", name),
            Origin::Override => write!(f, "explicit override"),
        }
    }
}

/// Problem found with a single configuration field.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum FieldError {
    /// No source provided a value for a required field.
    #[error("{field}: missing required value")]
    Missing {
        /// Qualified name of the field.
        field: String,
    },

    /// The provided value cannot be converted to the declared type.
    #[error("{field}: expected {expected} but got {actual} from {origin}")]
    TypeMismatch {
        /// Qualified name of the field.
        field: String,

        /// Where the offending value came from.
        origin: Origin,

        /// Description of the declared type.
        expected: String,

        /// Description of the provided value.
        actual: String,
    },

    /// The provided value has the right type but is not acceptable.
    #[error("{field}: invalid value from {origin}: {detail}")]
    Invalid {
        /// Qualified name of the field.
        field: String,

        /// Where the offending value came from.
        origin: Origin,

        /// Explanation of the problem.
        detail: String,
    },
}

impl FieldError {
    /// Returns the qualified name of the field this error is about.
    pub fn field(&self) -> &str {
        match self {
            FieldError::Missing { field } => field,
            FieldError::TypeMismatch { field, .. } => field,
            FieldError::Invalid { field, .. } => field,
        }
    }
}

/// Formats a list of field errors for inclusion in a `ConfigError`.
fn format_field_errors(errors: &[FieldError]) -> String {
    let details = errors.iter().map(FieldError::to_string).collect::<Vec<String>>();
    format!("{} field(s) failed: {}", errors.len(), details.join("; "))
}

/// Configuration errors.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Indicates that a configuration file could not be read.
    #[error("Cannot read {}: {message}", .path.display())]
    File {
        /// Path to the file that failed to load.
        path: PathBuf,

        /// Description of the I/O problem.
        message: String,
    },

    /// Indicates that the YAML file is malformed or is not a mapping.
    #[error("Invalid YAML in {}: {message}", .path.display())]
    Yaml {
        /// Path to the offending file.
        path: PathBuf,

        /// Description of the parsing problem.
        message: String,
    },

    /// Indicates that one or more fields failed validation.
    #[error("Invalid configuration: {}", format_field_errors(.0))]
    Invalid(Vec<FieldError>),

    /// Indicates that the validated values do not match the settings type.
    #[error("Cannot build settings: {0}")]
    Deserialize(String),
}

impl ConfigError {
    /// Returns the list of failed fields if this is a validation error.
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            ConfigError::Invalid(errors) => errors,
            _ => &[],
        }
    }
}

/// Result type for this module.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// A typed settings object that can be loaded by `ConfigLoader`.
///
/// The type is deserialized from a JSON object whose keys are the names of the fields declared by
/// `schema`, after they have been merged and validated.  Optional fields are passed as nulls so
/// they should be represented as `Option`s.
///
/// Settings compose: a service that needs the settings of several adapters can embed them with
/// `#[serde(flatten)]` and return the union of their schemas via `Schema::extend`.
pub trait Settings: DeserializeOwned {
    /// Returns the declaration of all fields in this settings type.
    fn schema() -> Schema;
}

/// Reads the YAML file at `path` and returns its top-level mapping.
fn read_yaml(path: &Path) -> ConfigResult<Map<String, Value>> {
    let content = fs::read_to_string(path)
        .map_err(|e| ConfigError::File { path: path.to_owned(), message: e.to_string() })?;
    if content.trim().is_empty() {
        return Ok(Map::new());
    }
    let value: Value = serde_yaml::from_str(&content)
        .map_err(|e| ConfigError::Yaml { path: path.to_owned(), message: e.to_string() })?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(ConfigError::Yaml {
            path: path.to_owned(),
            message: "Top-level document is not a mapping".to_owned(),
        }),
    }
}

/// Looks for a file in `dir` whose name matches `name` case-insensitively.
fn find_secret(dir: &Path, name: &str) -> ConfigResult<Option<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ConfigError::File { path: dir.to_owned(), message: e.to_string() });
        }
    };
    for entry in entries {
        let entry =
            entry.map_err(|e| ConfigError::File { path: dir.to_owned(), message: e.to_string() })?;
        let file_name = entry.file_name();
        match file_name.to_str() {
            Some(file_name) if file_name.eq_ignore_ascii_case(name) => {
                let path = entry.path();
                if path.is_file() {
                    return Ok(Some(path));
                }
            }
            _ => (),
        }
    }
    Ok(None)
}

/// Loads `Settings` types from layered configuration sources.
#[derive(Clone, Debug)]
pub struct ConfigLoader {
    /// Prefix for environment variables, secret files and the default YAML file name.
    prefix: String,

    /// Explicitly-requested YAML file, which must exist.
    yaml: Option<PathBuf>,

    /// Directories in which to look for the default YAML file.  `None` means the current
    /// directory and the home directory.
    search_dirs: Option<Vec<PathBuf>>,

    /// Directory containing secret files, if any.
    secrets_dir: Option<PathBuf>,

    /// Values that take precedence over all other sources.
    overrides: Map<String, Value>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_PREFIX)
    }
}

impl ConfigLoader {
    /// Creates a new loader that reads environment variables named `<prefix>_<field>`.
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self {
            prefix: prefix.into(),
            yaml: None,
            search_dirs: None,
            secrets_dir: None,
            overrides: Map::new(),
        }
    }

    /// Reads values from the YAML file at `path`, which must exist, instead of searching for the
    /// default file.
    pub fn with_yaml<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.yaml = Some(path.into());
        self
    }

    /// Replaces the directories in which to look for the default YAML file.
    ///
    /// Passing an empty list disables the search.
    pub fn with_search_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.search_dirs = Some(dirs);
        self
    }

    /// Reads values from secret files in `dir`.
    pub fn with_secrets_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.secrets_dir = Some(dir.into());
        self
    }

    /// Sets `field` to `value` with the highest precedence.
    pub fn with_override<K: Into<String>, V: Into<Value>>(mut self, field: K, value: V) -> Self {
        self.overrides.insert(field.into(), value.into());
        self
    }

    /// Gets the prefix used by this loader.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Computes the candidate locations of the default YAML file, in search order.
    pub fn default_yaml_paths(&self) -> Vec<PathBuf> {
        let file_name = format!(".{}.yaml", self.prefix);
        let dirs = match &self.search_dirs {
            Some(dirs) => dirs.clone(),
            None => std::env::current_dir().ok().into_iter().chain(dirs::home_dir()).collect(),
        };
        dirs.into_iter().map(|dir| dir.join(&file_name)).collect()
    }

    /// Determines which YAML file to read, if any.
    fn yaml_path(&self) -> ConfigResult<Option<PathBuf>> {
        if let Some(path) = &self.yaml {
            if !path.is_file() {
                return Err(ConfigError::File {
                    path: path.clone(),
                    message: "File not found".to_owned(),
                });
            }
            return Ok(Some(path.clone()));
        }
        Ok(self.default_yaml_paths().into_iter().find(|path| path.is_file()))
    }

    /// Gathers, merges and validates the values for all fields in `schema`.
    ///
    /// Returns a JSON object with one key per declared field.
    pub fn load_value(&self, schema: &Schema) -> ConfigResult<Value> {
        let (values, _origins) = self.resolve(schema)?;
        Ok(Value::Object(values))
    }

    /// Gathers, merges and validates the values for all fields in `schema`, and returns them
    /// along with the source each one came from.
    fn resolve(
        &self,
        schema: &Schema,
    ) -> ConfigResult<(Map<String, Value>, HashMap<String, Origin>)> {
        let yaml = match self.yaml_path()? {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                let map = read_yaml(&path)?;
                for key in map.keys() {
                    if schema.get(key).is_none() {
                        debug!("Ignoring undeclared key {} in {}", key, path.display());
                    }
                }
                Some((path, map))
            }
            None => {
                debug!("No configuration file found for prefix {}", self.prefix);
                None
            }
        };

        let mut errors = vec![];
        for key in self.overrides.keys() {
            if schema.get(key).is_none() {
                errors.push(FieldError::Invalid {
                    field: key.clone(),
                    origin: Origin::Override,
                    detail: "not a declared field".to_owned(),
                });
            }
        }

        let mut result = Map::new();
        let mut origins = HashMap::new();
        for field in schema.fields() {
            let mut candidate = match field.requirement() {
                Requirement::Required => None,
                Requirement::Default(value) => Some((value.clone(), Origin::Default)),
                Requirement::Optional => Some((Value::Null, Origin::Default)),
            };

            if let Some((path, map)) = &yaml {
                if let Some(value) = map.get(field.name()) {
                    candidate = Some((value.clone(), Origin::Yaml(path.clone())));
                }
            }

            if let Some(dir) = &self.secrets_dir {
                let name = format!("{}_{}", self.prefix, field.name());
                if let Some(path) = find_secret(dir, &name)? {
                    let content = fs::read_to_string(&path).map_err(|e| ConfigError::File {
                        path: path.clone(),
                        message: e.to_string(),
                    })?;
                    let value = Value::String(content.trim().to_owned());
                    candidate = Some((value, Origin::Secret(path)));
                }
            }

            match env::get_var_ignore_case(&self.prefix, field.name()) {
                Ok(Some((name, value))) => {
                    candidate = Some((Value::String(value), Origin::Env(name)));
                }
                Ok(None) => (),
                Err(detail) => {
                    errors.push(FieldError::Invalid {
                        field: field.name().to_owned(),
                        origin: Origin::Env(format!("{}_{}", self.prefix, field.name())),
                        detail,
                    });
                    continue;
                }
            }

            if let Some(value) = self.overrides.get(field.name()) {
                candidate = Some((value.clone(), Origin::Override));
            }

            match candidate {
                Some((value, origin)) => {
                    if let Some(value) =
                        coerce::coerce_field(field, value, field.name(), &origin, &mut errors)
                    {
                        result.insert(field.name().to_owned(), value);
                        origins.insert(field.name().to_owned(), origin);
                    }
                }
                None => errors.push(FieldError::Missing { field: field.name().to_owned() }),
            }
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }
        Ok((result, origins))
    }

    /// Loads a settings object of type `T`.
    ///
    /// Values that pass validation but cannot be represented by `T` (such as a negative number
    /// for an unsigned field) are reported as invalid for the field that holds them.
    pub fn load<T: Settings>(&self) -> ConfigResult<T> {
        let (values, origins) = self.resolve(&T::schema())?;

        let mut tracker =
            FieldTracker { entries: values.into_iter(), current: None, failed: None };
        match T::deserialize(MapAccessDeserializer::new(&mut tracker)) {
            Ok(settings) => Ok(settings),
            Err(e) => match tracker.failed {
                Some(field) => {
                    let origin = origins.get(&field).cloned().unwrap_or(Origin::Default);
                    Err(ConfigError::Invalid(vec![FieldError::Invalid {
                        field,
                        origin,
                        detail: e.to_string(),
                    }]))
                }
                None => Err(ConfigError::Deserialize(e.to_string())),
            },
        }
    }
}

/// Feeds the validated values of a settings object to its `Deserialize` implementation while
/// remembering which field was being processed when deserialization failed.
struct FieldTracker {
    /// Fields that have not been handed out yet.
    entries: serde_json::map::IntoIter,

    /// Field whose key was handed out last and whose value is pending.
    current: Option<(String, Value)>,

    /// Name of the field whose value could not be deserialized.
    failed: Option<String>,
}

impl<'de> MapAccess<'de> for FieldTracker {
    type Error = serde_json::Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, Self::Error>
    where
        K: DeserializeSeed<'de>,
    {
        let Some((key, value)) = self.entries.next() else {
            return Ok(None);
        };
        let parsed = seed.deserialize(StringDeserializer::<Self::Error>::new(key.clone()))?;
        self.current = Some((key, value));
        Ok(Some(parsed))
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, Self::Error>
    where
        V: DeserializeSeed<'de>,
    {
        let Some((key, value)) = self.current.take() else {
            return Err(de::Error::custom("value requested before its key"));
        };
        seed.deserialize(value).map_err(|e| {
            self.failed = Some(key);
            e
        })
    }
}
