//! Nested key/value settings trees used to persist workflows.
//!
//! A [`Settings`] object is a tree: leaves are integers, booleans and
//! strings, inner nodes are named sub-configurations. Workflow managers
//! serialize themselves into such a tree (counters, then nodes, then
//! connections) and reconstruct themselves from one; nodes store their
//! own opaque sub-tree through the same type.
//!
//! The tree is backed by a [`serde_json::Map`], so a settings object
//! converts losslessly to and from JSON for file persistence. Typed
//! accessors return a [`SettingsError`] instead of panicking when a key
//! is missing or holds the wrong type; load paths use this to skip
//! malformed entries instead of aborting.

use miette::Diagnostic;
use serde_json::{Map, Value};
use std::io::{Read, Write};
use thiserror::Error;

/// Errors raised by typed access into a settings tree.
#[derive(Debug, Error, Diagnostic)]
pub enum SettingsError {
    /// The requested key does not exist in this configuration.
    #[error("settings key {key:?} is missing")]
    #[diagnostic(code(trellis::settings::missing_key))]
    MissingKey { key: String },

    /// The key exists but holds a value of a different type.
    #[error("settings key {key:?} is not a {expected}")]
    #[diagnostic(
        code(trellis::settings::type_mismatch),
        help("The settings tree may have been produced by an incompatible writer.")
    )]
    TypeMismatch { key: String, expected: &'static str },

    /// The underlying JSON document could not be read or written.
    #[error(transparent)]
    #[diagnostic(code(trellis::settings::json))]
    Json(#[from] serde_json::Error),
}

/// One level of a nested key/value settings tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Settings {
    entries: Map<String, Value>,
}

impl Settings {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Map::new(),
        }
    }

    /// Number of entries at this level.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys at this level, in stable (sorted) order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn add_i64(&mut self, key: impl Into<String>, value: i64) {
        self.entries.insert(key.into(), Value::from(value));
    }

    pub fn add_bool(&mut self, key: impl Into<String>, value: bool) {
        self.entries.insert(key.into(), Value::from(value));
    }

    pub fn add_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), Value::from(value.into()));
    }

    /// Store an arbitrary JSON value under `key`.
    pub fn add_value(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Attach a child configuration under `key`.
    pub fn set_config(&mut self, key: impl Into<String>, config: Settings) {
        self.entries
            .insert(key.into(), Value::Object(config.entries));
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, SettingsError> {
        self.get(key)?
            .as_i64()
            .ok_or(SettingsError::TypeMismatch {
                key: key.to_string(),
                expected: "integer",
            })
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, SettingsError> {
        self.get(key)?
            .as_bool()
            .ok_or(SettingsError::TypeMismatch {
                key: key.to_string(),
                expected: "boolean",
            })
    }

    pub fn get_string(&self, key: &str) -> Result<String, SettingsError> {
        self.get(key)?
            .as_str()
            .map(str::to_string)
            .ok_or(SettingsError::TypeMismatch {
                key: key.to_string(),
                expected: "string",
            })
    }

    /// Raw JSON value stored under `key`.
    pub fn get_value(&self, key: &str) -> Result<&Value, SettingsError> {
        self.get(key)
    }

    /// Child configuration stored under `key`.
    pub fn get_config(&self, key: &str) -> Result<Settings, SettingsError> {
        match self.get(key)? {
            Value::Object(map) => Ok(Settings {
                entries: map.clone(),
            }),
            _ => Err(SettingsError::TypeMismatch {
                key: key.to_string(),
                expected: "configuration",
            }),
        }
    }

    fn get(&self, key: &str) -> Result<&Value, SettingsError> {
        self.entries.get(key).ok_or(SettingsError::MissingKey {
            key: key.to_string(),
        })
    }

    /// The whole tree as a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.entries.clone())
    }

    /// Rebuild a settings tree from a JSON object value.
    pub fn from_value(value: Value) -> Result<Self, SettingsError> {
        match value {
            Value::Object(entries) => Ok(Settings { entries }),
            _ => Err(SettingsError::TypeMismatch {
                key: String::new(),
                expected: "configuration",
            }),
        }
    }

    /// Serialize the tree as pretty-printed JSON.
    pub fn write_to(&self, writer: impl Write) -> Result<(), SettingsError> {
        serde_json::to_writer_pretty(writer, &self.to_value())?;
        Ok(())
    }

    /// Parse a tree from a JSON document.
    pub fn read_from(reader: impl Read) -> Result<Self, SettingsError> {
        let value: Value = serde_json::from_reader(reader)?;
        Self::from_value(value)
    }
}
