//! The metric value model shared by plugins and filters.
//!
//! This is deliberately small: the core only needs enough structure to route
//! metrics through filters and the plugin capability traits. Batching,
//! buffering and wire formats live outside this crate.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

/// A single field value of a metric.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    String(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Boolean(v) => write!(f, "{v}"),
            FieldValue::String(v) => write!(f, "{v}"),
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

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_owned())
    }
}

/// One measurement: a name, a set of tags, a set of fields and a timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: SystemTime,
}

impl Metric {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp: SystemTime::now(),
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
}

/// Where inputs and aggregators deposit the metrics they produce.
///
/// The agent owns the implementation; plugins only see the trait.
pub trait Accumulator {
    /// Adds a complete metric.
    fn add_metric(&mut self, metric: Metric);

    /// Convenience form: builds a metric from parts and adds it.
    fn add_fields(
        &mut self,
        name: &str,
        fields: BTreeMap<String, FieldValue>,
        tags: BTreeMap<String, String>,
    ) {
        self.add_metric(Metric {
            name: name.to_owned(),
            tags,
            fields,
            timestamp: SystemTime::now(),
        });
    }

    /// Reports a non-fatal error encountered during collection.
    fn add_error(&mut self, error: anyhow::Error);
}
