// ============================================================================
// VALUE REDUCTION
// ============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::bucketize::Distribution;
use super::descriptor::{FieldArity, FieldSpec};
use super::{DataPoint, FieldValue};
use crate::error::{MetricError, MetricResult};

/// A computed value: a plain sum, a per-key breakdown, or a distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReducedValue {
    Scalar(f64),
    Distribution(Distribution),
    Discrete(BTreeMap<String, ReducedValue>),
}

impl ReducedValue {
    /// Zero value for a decomposition ordered discrete-first
    pub fn zero(decomposition: &[&FieldSpec]) -> Self {
        match decomposition.first().map(|f| f.arity) {
            None => ReducedValue::Scalar(0.0),
            Some(FieldArity::Discrete) => ReducedValue::Discrete(BTreeMap::new()),
            Some(FieldArity::Numeric) => ReducedValue::Distribution(Distribution::new()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReducedValue::Scalar(_) => "scalar",
            ReducedValue::Distribution(_) => "distribution",
            ReducedValue::Discrete(_) => "discrete",
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            ReducedValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// Fold `other` into `self`: scalars add, maps merge key-wise and
    /// distributions add bucket weights
    pub fn merge(&mut self, other: &ReducedValue) -> MetricResult<()> {
        match (self, other) {
            (ReducedValue::Scalar(a), ReducedValue::Scalar(b)) => {
                *a += b;
                Ok(())
            }
            (ReducedValue::Distribution(a), ReducedValue::Distribution(b)) => {
                a.merge(b);
                Ok(())
            }
            (ReducedValue::Discrete(a), ReducedValue::Discrete(b)) => {
                for (key, value) in b {
                    match a.get_mut(key) {
                        Some(existing) => existing.merge(value)?,
                        None => {
                            a.insert(key.clone(), value.clone());
                        }
                    }
                }
                Ok(())
            }
            (left, right) => Err(MetricError::ShapeMismatch {
                left: left.kind(),
                right: right.kind(),
            }),
        }
    }
}

impl Default for ReducedValue {
    fn default() -> Self {
        ReducedValue::Scalar(0.0)
    }
}

/// Reduce data points along a decomposition ordered discrete-first,
/// numeric-last
pub fn reduce(points: &[DataPoint], decomposition: &[&FieldSpec]) -> ReducedValue {
    let refs: Vec<&DataPoint> = points.iter().collect();
    reduce_refs(&refs, decomposition)
}

fn reduce_refs(points: &[&DataPoint], decomposition: &[&FieldSpec]) -> ReducedValue {
    let Some((field, rest)) = decomposition.split_first() else {
        return ReducedValue::Scalar(points.iter().map(|p| p.value).sum());
    };

    match field.arity {
        FieldArity::Discrete => {
            let mut groups: BTreeMap<String, Vec<&DataPoint>> = BTreeMap::new();
            for point in points {
                if let Some(key) = point.fields.get(&field.name) {
                    groups.entry(key.to_string()).or_default().push(point);
                }
            }
            ReducedValue::Discrete(
                groups
                    .into_iter()
                    .map(|(key, group)| (key, reduce_refs(&group, rest)))
                    .collect(),
            )
        }
        FieldArity::Numeric => {
            let mut dist = Distribution::new();
            if let Some(bucketizer) = &field.bucketizer {
                for point in points {
                    if let Some(FieldValue::Number(v)) = point.fields.get(&field.name) {
                        bucketizer.bucketize(&mut dist, *v, point.value);
                    }
                }
            }
            ReducedValue::Distribution(dist)
        }
    }
}
