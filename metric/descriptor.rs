// ============================================================================
// METRIC DESCRIPTORS
// ============================================================================

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::bucketize::Bucketizer;
use super::{FieldMap, FieldValue, Sample};
use crate::message::{FieldInfo, StatInfo};
use crate::HOSTNAME_FIELD;

/// Whether a field groups (discrete) or bucketizes (numeric)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldArity {
    Discrete,
    Numeric,
}

/// Values a field takes for one (current, previous) sample pair
pub type ValuesFn = Arc<dyn Fn(&Sample, &Sample, Duration) -> Vec<FieldValue> + Send + Sync>;

/// Numeric contribution of one data point; `None` drops it
pub type ExtractFn =
    Arc<dyn Fn(&FieldMap, &Sample, &Sample, Duration) -> Option<f64> + Send + Sync>;

// ----------------------------------------------------------------------------
// Field Specification
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct FieldSpec {
    pub name: String,
    pub label: String,
    pub arity: FieldArity,
    pub values: ValuesFn,
    pub bucketizer: Option<Bucketizer>,
}

impl FieldSpec {
    pub fn discrete<F>(name: impl Into<String>, label: impl Into<String>, values: F) -> Self
    where
        F: Fn(&Sample, &Sample, Duration) -> Vec<FieldValue> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            label: label.into(),
            arity: FieldArity::Discrete,
            values: Arc::new(values),
            bucketizer: None,
        }
    }

    pub fn numeric<F>(
        name: impl Into<String>,
        label: impl Into<String>,
        bucketizer: Bucketizer,
        values: F,
    ) -> Self
    where
        F: Fn(&Sample, &Sample, Duration) -> Vec<FieldValue> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            label: label.into(),
            arity: FieldArity::Numeric,
            values: Arc::new(values),
            bucketizer: Some(bucketizer),
        }
    }

    /// Discrete field read from a sample attribute
    pub fn attr(name: impl Into<String>, label: impl Into<String>, attr: &'static str) -> Self {
        Self::discrete(name, label, move |cur, _, _| {
            cur.attr(attr)
                .map(|v| vec![FieldValue::from(v)])
                .unwrap_or_default()
        })
    }

    /// Discrete field with a fixed set of values
    pub fn fixed(name: impl Into<String>, label: impl Into<String>, values: &[&str]) -> Self {
        let values: Vec<FieldValue> = values.iter().map(|v| FieldValue::from(*v)).collect();
        Self::discrete(name, label, move |_, _, _| values.clone())
    }

    pub fn info(&self) -> FieldInfo {
        FieldInfo {
            label: self.label.clone(),
            arity: self.arity,
        }
    }
}

impl Debug for FieldSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSpec")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("bucketizer", &self.bucketizer)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Metric Descriptor
// ----------------------------------------------------------------------------

/// Everything needed to compute one module/stat from raw samples
#[derive(Clone)]
pub struct MetricDescriptor {
    pub module: String,
    pub stat: String,
    pub label: String,
    /// Unit type shown in the catalog ("ops", "percent", "bytes", ...)
    pub unit: String,
    fields: Vec<FieldSpec>,
    extract: ExtractFn,
    extract_uses: Vec<String>,
}

impl MetricDescriptor {
    /// A descriptor whose data points each contribute 1
    pub fn new(
        module: impl Into<String>,
        stat: impl Into<String>,
        label: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            stat: stat.into(),
            label: label.into(),
            unit: unit.into(),
            fields: Vec::new(),
            extract: Arc::new(|_, _, _, _| Some(1.0)),
            extract_uses: Vec::new(),
        }
    }

    /// Add a field. A later field with the same name replaces the earlier one.
    pub fn field(mut self, spec: FieldSpec) -> Self {
        match self.fields.iter_mut().find(|f| f.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.fields.push(spec),
        }
        self
    }

    /// Set the extract function and the fields it reads from the data point
    pub fn with_extract<F>(mut self, uses: &[&str], extract: F) -> Self
    where
        F: Fn(&FieldMap, &Sample, &Sample, Duration) -> Option<f64> + Send + Sync + 'static,
    {
        self.extract = Arc::new(extract);
        self.extract_uses = uses.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Add the identity field, fixed to this host
    pub fn with_hostname(self, hostname: &str) -> Self {
        if self.field_spec(HOSTNAME_FIELD).is_some() {
            return self;
        }
        let host = FieldValue::from(hostname);
        self.field(FieldSpec::discrete(HOSTNAME_FIELD, "hostname", move |_, _, _| {
            vec![host.clone()]
        }))
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field_spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn arity_of(&self, name: &str) -> Option<FieldArity> {
        self.field_spec(name).map(|f| f.arity)
    }

    pub fn extract_uses(&self) -> &[String] {
        &self.extract_uses
    }

    #[inline]
    pub fn extract(&self, point: &FieldMap, cur: &Sample, prev: &Sample, interval: Duration) -> Option<f64> {
        (self.extract)(point, cur, prev, interval)
    }

    /// Catalog entry for this metric
    pub fn stat_info(&self) -> StatInfo {
        StatInfo {
            label: self.label.clone(),
            unit: self.unit.clone(),
            fields: self
                .fields
                .iter()
                .map(|f| (f.name.clone(), f.info()))
                .collect::<BTreeMap<_, _>>(),
        }
    }
}

impl Debug for MetricDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricDescriptor")
            .field("module", &self.module)
            .field("stat", &self.stat)
            .field("fields", &self.fields)
            .field("extract_uses", &self.extract_uses)
            .finish()
    }
}
