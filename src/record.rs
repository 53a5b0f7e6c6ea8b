//! Records flowing through the enrichment engine.
//!
//! A [`RawRecord`] is one row read from an input stream; an [`EnrichedRecord`]
//! is the merged output of every calculator registered for that stream,
//! addressed to the group's output stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type TagMap = BTreeMap<String, String>;
pub type FieldMap = BTreeMap<String, FieldValue>;

/// A single field value as stored in the time-series database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value. Text is parsed leniently since some
    /// collectors store numbers as strings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Float(v) if v.is_finite() => Some(*v),
            FieldValue::Float(_) => None,
            FieldValue::Boolean(_) => None,
            FieldValue::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(FieldValue::Integer)
                .or_else(|| n.as_f64().map(FieldValue::Float)),
            serde_json::Value::String(s) => Some(FieldValue::Text(s.clone())),
            serde_json::Value::Bool(b) => Some(FieldValue::Boolean(*b)),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Boolean(v) => write!(f, "{}", v),
            FieldValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// One row fetched from an input stream. Never mutated after fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: TagMap,
    #[serde(default)]
    pub fields: FieldMap,
}

impl RawRecord {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            tags: TagMap::new(),
            fields: FieldMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(FieldValue::as_f64)
    }
}

/// Derived record addressed to an output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub output_stream: String,
    pub timestamp: DateTime<Utc>,
    pub tags: TagMap,
    pub fields: FieldMap,
}

impl EnrichedRecord {
    /// Carries the source record's timestamp and tags over to `output_stream`.
    pub fn from_raw(output_stream: impl Into<String>, raw: &RawRecord, fields: FieldMap) -> Self {
        Self {
            output_stream: output_stream.into(),
            timestamp: raw.timestamp,
            tags: raw.tags.clone(),
            fields,
        }
    }

    /// The same record as it reads back from the output stream.
    pub fn to_raw(&self) -> RawRecord {
        RawRecord {
            timestamp: self.timestamp,
            tags: self.tags.clone(),
            fields: self.fields.clone(),
        }
    }
}
