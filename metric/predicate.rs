// ============================================================================
// PREDICATES
// ============================================================================
// Boolean filters over data points. JSON form:
//
//   {}                                   trivial (always true)
//   {"eq": ["hostname", "web1"]}         leaf comparison
//   {"and": [...]} / {"or": [...]}       combinators
// ============================================================================

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use super::descriptor::FieldArity;
use super::{FieldMap, FieldValue};
use crate::error::{MetricError, MetricResult};

// ----------------------------------------------------------------------------
// Comparison Operators
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ComparisonOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "eq",
            ComparisonOp::Ne => "ne",
            ComparisonOp::Lt => "lt",
            ComparisonOp::Le => "le",
            ComparisonOp::Gt => "gt",
            ComparisonOp::Ge => "ge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(ComparisonOp::Eq),
            "ne" => Some(ComparisonOp::Ne),
            "lt" => Some(ComparisonOp::Lt),
            "le" => Some(ComparisonOp::Le),
            "gt" => Some(ComparisonOp::Gt),
            "ge" => Some(ComparisonOp::Ge),
            _ => None,
        }
    }

    /// Apply the comparison. Numbers compare numerically, strings lexically.
    /// Mixed kinds are never equal and never ordered.
    pub fn apply(&self, left: &FieldValue, right: &FieldValue) -> bool {
        let ordering = match (left, right) {
            (FieldValue::Number(a), FieldValue::Number(b)) => a.partial_cmp(b),
            (FieldValue::Text(a), FieldValue::Text(b)) => Some(a.cmp(b)),
            _ => None,
        };

        match (self, ordering) {
            (ComparisonOp::Ne, None) => true,
            (_, None) => false,
            (ComparisonOp::Eq, Some(o)) => o == Ordering::Equal,
            (ComparisonOp::Ne, Some(o)) => o != Ordering::Equal,
            (ComparisonOp::Lt, Some(o)) => o == Ordering::Less,
            (ComparisonOp::Le, Some(o)) => o != Ordering::Greater,
            (ComparisonOp::Gt, Some(o)) => o == Ordering::Greater,
            (ComparisonOp::Ge, Some(o)) => o != Ordering::Less,
        }
    }
}

// ----------------------------------------------------------------------------
// Expressions
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare {
        op: ComparisonOp,
        field: String,
        value: FieldValue,
    },
}

impl Expr {
    pub fn compare(op: ComparisonOp, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Expr::Compare {
            op,
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::compare(ComparisonOp::Eq, field, value)
    }

    pub fn eval(&self, point: &FieldMap) -> bool {
        match self {
            Expr::And(children) => children.iter().all(|c| c.eval(point)),
            Expr::Or(children) => children.iter().any(|c| c.eval(point)),
            Expr::Compare { op, field, value } => point
                .get(field)
                .map(|actual| op.apply(actual, value))
                .unwrap_or(false),
        }
    }

    fn collect_fields(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::And(children) | Expr::Or(children) => {
                for child in children {
                    child.collect_fields(out);
                }
            }
            Expr::Compare { field, .. } => {
                out.insert(field.clone());
            }
        }
    }

    fn check_shape(&self) -> MetricResult<()> {
        match self {
            Expr::And(children) | Expr::Or(children) => {
                if children.is_empty() {
                    let op = if matches!(self, Expr::And(_)) { "and" } else { "or" };
                    return Err(MetricError::EmptyCombinator { op });
                }
                children.iter().try_for_each(Expr::check_shape)
            }
            Expr::Compare { .. } => Ok(()),
        }
    }

    fn to_json(&self) -> Value {
        let (key, arg) = match self {
            Expr::And(children) => ("and", Value::Array(children.iter().map(Expr::to_json).collect())),
            Expr::Or(children) => ("or", Value::Array(children.iter().map(Expr::to_json).collect())),
            Expr::Compare { op, field, value } => {
                let literal = match value {
                    FieldValue::Number(n) => serde_json::Number::from_f64(*n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null),
                    FieldValue::Text(s) => Value::String(s.clone()),
                };
                (op.as_str(), Value::Array(vec![Value::String(field.clone()), literal]))
            }
        };
        let mut object = Map::new();
        object.insert(key.to_string(), arg);
        Value::Object(object)
    }

    fn from_json(value: &Value) -> Result<Self, String> {
        let object = value
            .as_object()
            .ok_or_else(|| format!("predicate must be an object, got {}", value))?;
        let mut entries = object.iter();
        let (key, arg) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => return Err(format!("predicate must have exactly one key, got {}", object.len())),
        };

        match key.as_str() {
            "and" | "or" => {
                let children = arg
                    .as_array()
                    .ok_or_else(|| format!("'{}' expects an array of predicates", key))?
                    .iter()
                    .map(Expr::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if key == "and" { Expr::And(children) } else { Expr::Or(children) })
            }
            other => {
                let op = ComparisonOp::parse(other)
                    .ok_or_else(|| format!("unknown predicate operator '{}'", other))?;
                let pair = arg
                    .as_array()
                    .filter(|pair| pair.len() == 2)
                    .ok_or_else(|| format!("'{}' expects [field, value]", other))?;
                let field = pair[0]
                    .as_str()
                    .ok_or_else(|| format!("'{}' field name must be a string", other))?;
                let literal = match &pair[1] {
                    Value::Number(n) => n
                        .as_f64()
                        .map(FieldValue::Number)
                        .ok_or_else(|| format!("'{}' literal out of range", other))?,
                    Value::String(s) => FieldValue::Text(s.clone()),
                    v => return Err(format!("'{}' literal must be a number or string, got {}", other, v)),
                };
                Ok(Expr::compare(op, field, literal))
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Predicate
// ----------------------------------------------------------------------------

/// A filter over data points. `Predicate::trivial()` accepts everything.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Predicate(Option<Expr>);

impl Predicate {
    pub fn trivial() -> Self {
        Predicate(None)
    }

    pub fn new(expr: Expr) -> Self {
        Predicate(Some(expr))
    }

    pub fn is_trivial(&self) -> bool {
        self.0.is_none()
    }

    pub fn expr(&self) -> Option<&Expr> {
        self.0.as_ref()
    }

    pub fn eval(&self, point: &FieldMap) -> bool {
        self.0.as_ref().map(|e| e.eval(point)).unwrap_or(true)
    }

    /// Every field name referenced by the predicate
    pub fn fields(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        if let Some(expr) = &self.0 {
            expr.collect_fields(&mut out);
        }
        out
    }

    /// Check the predicate against the fields a metric exposes
    pub fn validate<F>(&self, module: &str, stat: &str, arity_of: F) -> MetricResult<()>
    where
        F: Fn(&str) -> Option<FieldArity>,
    {
        let Some(expr) = &self.0 else {
            return Ok(());
        };
        expr.check_shape()?;
        for field in self.fields() {
            if arity_of(field.as_str()).is_none() {
                return Err(MetricError::unknown_field(field, module, stat));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Value {
        match &self.0 {
            None => Value::Object(Map::new()),
            Some(expr) => expr.to_json(),
        }
    }

    pub fn from_json(value: &Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(Predicate::trivial()),
            Value::Object(object) if object.is_empty() => Ok(Predicate::trivial()),
            other => Expr::from_json(other).map(Predicate::new),
        }
    }
}

impl From<Expr> for Predicate {
    fn from(expr: Expr) -> Self {
        Predicate::new(expr)
    }
}

impl Serialize for Predicate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Predicate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Predicate::from_json(&value).map_err(D::Error::custom)
    }
}
