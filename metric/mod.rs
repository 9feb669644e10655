//! Metric computation model.
//!
//! Turns a pair of counter snapshots into one reduced value:
//!
//! ```text
//! samples (cur, prev) ──► expand (cartesian over needed fields) ──► data points
//!        ──► predicate filter ──► extract ──► reduce (discrete groups, numeric buckets)
//! ```
//!
//! Everything here is pure and deterministic; the agent runtime owns state.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod bucketize;
pub mod descriptor;
pub mod expand;
pub mod predicate;
pub mod query;
pub mod reduce;

pub use bucketize::{Bucket, Bucketizer, Distribution};
pub use descriptor::{FieldArity, FieldSpec, MetricDescriptor};
pub use expand::{cartesian, expand, FieldMap};
pub use predicate::{ComparisonOp, Expr, Predicate};
pub use query::{validate_request, CompiledQuery};
pub use reduce::{reduce, ReducedValue};

// ----------------------------------------------------------------------------
// Field Values
// ----------------------------------------------------------------------------

/// Value of one field in a data point, or a predicate literal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Number(_) => None,
            FieldValue::Text(s) => Some(s),
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Number(n as f64)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

// ----------------------------------------------------------------------------
// Samples & Data Points
// ----------------------------------------------------------------------------

/// One kstat-like snapshot of a counter set
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sample {
    /// Identity of the counter set (e.g. "cpu_stat:0")
    pub key: String,
    /// Snapshot time in nanoseconds
    pub snaptime: i64,
    /// Cumulative numeric counters
    pub counters: HashMap<String, f64>,
    /// String attributes (device names, classes)
    pub attrs: HashMap<String, String>,
}

impl Sample {
    pub fn new(key: impl Into<String>, snaptime: i64) -> Self {
        Self {
            key: key.into(),
            snaptime,
            counters: HashMap::new(),
            attrs: HashMap::new(),
        }
    }

    pub fn with_counter(mut self, name: impl Into<String>, value: f64) -> Self {
        self.counters.insert(name.into(), value);
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    /// Counter value, zero when absent
    #[inline]
    pub fn counter(&self, name: &str) -> f64 {
        self.counters.get(name).copied().unwrap_or(0.0)
    }

    #[inline]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Increase of a counter since `prev`
    #[inline]
    pub fn delta(&self, prev: &Sample, name: &str) -> f64 {
        self.counter(name) - prev.counter(name)
    }

    /// Time elapsed since `prev`
    pub fn interval_since(&self, prev: &Sample) -> Duration {
        Duration::from_nanos(self.snaptime.saturating_sub(prev.snaptime).max(0) as u64)
    }
}

/// One combination of field values with its numeric contribution
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub fields: FieldMap,
    pub value: f64,
}
