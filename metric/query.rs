// ============================================================================
// COMPILED QUERIES
// ============================================================================
// A descriptor bound to one predicate and decomposition. Resolves the needed
// fields once so every evaluation is a straight pipeline.
// ============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::descriptor::{FieldArity, FieldSpec, MetricDescriptor};
use super::expand::expand;
use super::predicate::Predicate;
use super::reduce::{reduce, ReducedValue};
use super::{DataPoint, Sample};
use crate::error::{MetricError, MetricResult};
use crate::HOSTNAME_FIELD;

/// Validate a predicate and decomposition against the fields of one metric
pub fn validate_request<F>(
    module: &str,
    stat: &str,
    predicate: &Predicate,
    decomposition: &[String],
    arity_of: F,
) -> MetricResult<()>
where
    F: Fn(&str) -> Option<FieldArity>,
{
    let mut seen = BTreeSet::new();
    let mut numeric = Vec::new();

    for field in decomposition {
        if !seen.insert(field.as_str()) {
            return Err(MetricError::DuplicateDecomposition {
                field: field.clone(),
            });
        }
        match arity_of(field.as_str()) {
            None => return Err(MetricError::unknown_field(field.as_str(), module, stat)),
            Some(FieldArity::Numeric) => numeric.push(field.clone()),
            Some(FieldArity::Discrete) => {}
        }
    }

    if numeric.len() > 1 {
        return Err(MetricError::MultipleNumeric { fields: numeric });
    }

    predicate.validate(module, stat, &arity_of)
}

/// Order a decomposition discrete-first, numeric-last (stable otherwise)
pub fn order_decomposition<F>(decomposition: &[String], arity_of: F) -> Vec<String>
where
    F: Fn(&str) -> Option<FieldArity>,
{
    let (mut discrete, numeric): (Vec<String>, Vec<String>) = decomposition
        .iter()
        .cloned()
        .partition(|f| arity_of(f.as_str()) != Some(FieldArity::Numeric));
    discrete.extend(numeric);
    discrete
}

#[derive(Debug, Clone)]
pub struct CompiledQuery {
    descriptor: Arc<MetricDescriptor>,
    predicate: Predicate,
    /// Indices into the descriptor's fields
    needed: Vec<usize>,
    decomposition: Vec<usize>,
}

impl CompiledQuery {
    pub fn compile(
        descriptor: Arc<MetricDescriptor>,
        predicate: Predicate,
        decomposition: &[String],
    ) -> MetricResult<Self> {
        validate_request(
            &descriptor.module,
            &descriptor.stat,
            &predicate,
            decomposition,
            |f| descriptor.arity_of(f),
        )?;

        let index_of = |name: &str| -> MetricResult<usize> {
            descriptor
                .fields()
                .iter()
                .position(|f| f.name == name)
                .ok_or_else(|| {
                    MetricError::unknown_field(name, descriptor.module.as_str(), descriptor.stat.as_str())
                })
        };

        let ordered = order_decomposition(decomposition, |f| descriptor.arity_of(f));
        let mut decomposition_idx = Vec::with_capacity(ordered.len());
        for name in &ordered {
            let idx = index_of(name)?;
            let spec = &descriptor.fields()[idx];
            if spec.arity == FieldArity::Numeric {
                match spec.bucketizer {
                    None => {
                        return Err(MetricError::MissingBucketizer {
                            field: spec.name.clone(),
                        })
                    }
                    Some(b) if !b.is_valid() => {
                        return Err(MetricError::InvalidBucketizer {
                            field: spec.name.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
            decomposition_idx.push(idx);
        }

        let mut names: BTreeSet<String> = ordered.iter().cloned().collect();
        names.extend(predicate.fields());
        names.extend(descriptor.extract_uses().iter().cloned());
        if descriptor.field_spec(HOSTNAME_FIELD).is_some() {
            names.insert(HOSTNAME_FIELD.to_string());
        }
        let mut needed = names
            .iter()
            .map(|n| index_of(n))
            .collect::<MetricResult<Vec<_>>>()?;
        needed.sort_unstable();

        Ok(Self {
            descriptor,
            predicate,
            needed,
            decomposition: decomposition_idx,
        })
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    fn decomposition_specs(&self) -> Vec<&FieldSpec> {
        self.decomposition
            .iter()
            .map(|&i| &self.descriptor.fields()[i])
            .collect()
    }

    /// Names of the fields expanded for each sample pair
    pub fn needed_fields(&self) -> Vec<&str> {
        self.needed
            .iter()
            .map(|&i| self.descriptor.fields()[i].name.as_str())
            .collect()
    }

    pub fn zero(&self) -> ReducedValue {
        ReducedValue::zero(&self.decomposition_specs())
    }

    /// Filtered data points for one sample pair
    pub fn data_points(&self, cur: &Sample, prev: &Sample) -> Vec<DataPoint> {
        let interval = cur.interval_since(prev);
        let fields: Vec<&FieldSpec> = self
            .needed
            .iter()
            .map(|&i| &self.descriptor.fields()[i])
            .collect();

        expand(&fields, cur, prev, interval)
            .into_iter()
            .filter(|point| self.predicate.eval(point))
            .filter_map(|point| {
                let value = self.descriptor.extract(&point, cur, prev, interval)?;
                Some(DataPoint {
                    fields: point,
                    value,
                })
            })
            .collect()
    }

    /// Reduce the current snapshot against the previous one. Without a
    /// previous snapshot the result is the typed zero. Samples missing from
    /// the previous snapshot are skipped.
    pub fn evaluate(&self, current: &[Sample], previous: Option<&[Sample]>) -> ReducedValue {
        let Some(previous) = previous else {
            return self.zero();
        };

        let by_key: HashMap<&str, &Sample> =
            previous.iter().map(|s| (s.key.as_str(), s)).collect();

        let points: Vec<DataPoint> = current
            .iter()
            .filter_map(|cur| by_key.get(cur.key.as_str()).map(|prev| (cur, *prev)))
            .flat_map(|(cur, prev)| self.data_points(cur, prev))
            .collect();

        if points.is_empty() {
            return self.zero();
        }
        reduce(&points, &self.decomposition_specs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{Bucketizer, Expr, FieldValue};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn disk_ops() -> Arc<MetricDescriptor> {
        let desc = MetricDescriptor::new("disk", "physio_ops", "I/O operations", "ops")
            .field(FieldSpec::attr("disk", "device name", "name"))
            .field(FieldSpec::fixed("optype", "type", &["read", "write"]))
            .field(FieldSpec::numeric(
                "size",
                "average I/O size",
                Bucketizer::linear(1024.0),
                |cur, prev, _| {
                    let ops = cur.delta(prev, "reads") + cur.delta(prev, "writes");
                    let bytes = cur.delta(prev, "nread") + cur.delta(prev, "nwritten");
                    if ops > 0.0 {
                        vec![FieldValue::Number(bytes / ops)]
                    } else {
                        Vec::new()
                    }
                },
            ))
            .with_extract(&["optype"], |point, cur, prev, _| {
                match point.get("optype").and_then(FieldValue::as_str) {
                    Some("read") => Some(cur.delta(prev, "reads")),
                    Some("write") => Some(cur.delta(prev, "writes")),
                    _ => None,
                }
            })
            .with_hostname("web1");
        Arc::new(desc)
    }

    fn snapshot(time_s: i64, sd0: (f64, f64), sd1: (f64, f64)) -> Vec<Sample> {
        let at = time_s * 1_000_000_000;
        vec![
            Sample::new("sd:0", at)
                .with_attr("name", "sd0")
                .with_counter("reads", sd0.0)
                .with_counter("writes", sd0.1)
                .with_counter("nread", sd0.0 * 512.0)
                .with_counter("nwritten", sd0.1 * 512.0),
            Sample::new("sd:1", at)
                .with_attr("name", "sd1")
                .with_counter("reads", sd1.0)
                .with_counter("writes", sd1.1)
                .with_counter("nread", sd1.0 * 4096.0)
                .with_counter("nwritten", sd1.1 * 4096.0),
        ]
    }

    #[test]
    fn test_needed_fields_include_extract_uses() {
        let q = CompiledQuery::compile(disk_ops(), Predicate::trivial(), &[]).unwrap();
        assert_eq!(q.needed_fields(), vec!["optype", "hostname"]);
    }

    #[test]
    fn test_first_sample_is_typed_zero() {
        let q = CompiledQuery::compile(disk_ops(), Predicate::trivial(), &["disk".into()]).unwrap();
        assert_eq!(q.evaluate(&snapshot(1, (0.0, 0.0), (0.0, 0.0)), None), ReducedValue::Discrete(Default::default()));
    }

    #[test]
    fn test_scalar_total_counts_both_directions() {
        let q = CompiledQuery::compile(disk_ops(), Predicate::trivial(), &[]).unwrap();
        let prev = snapshot(1, (10.0, 5.0), (0.0, 0.0));
        let cur = snapshot(2, (14.0, 7.0), (3.0, 0.0));
        assert_eq!(q.evaluate(&cur, Some(&prev)), ReducedValue::Scalar(9.0));
    }

    #[test]
    fn test_decomposition_and_predicate() {
        let q = CompiledQuery::compile(
            disk_ops(),
            Predicate::new(Expr::eq("optype", "read")),
            &["disk".into()],
        )
        .unwrap();
        let prev = snapshot(1, (10.0, 5.0), (0.0, 0.0));
        let cur = snapshot(2, (14.0, 7.0), (3.0, 0.0));
        assert_eq!(
            serde_json::to_value(q.evaluate(&cur, Some(&prev))).unwrap(),
            json!({"sd0": 4.0, "sd1": 3.0})
        );
    }

    #[test]
    fn test_numeric_last_in_decomposition() {
        let q = CompiledQuery::compile(
            disk_ops(),
            Predicate::trivial(),
            &["size".into(), "disk".into()],
        )
        .unwrap();
        let prev = snapshot(1, (0.0, 0.0), (0.0, 0.0));
        let cur = snapshot(2, (2.0, 0.0), (1.0, 1.0));
        assert_eq!(
            serde_json::to_value(q.evaluate(&cur, Some(&prev))).unwrap(),
            json!({
                "sd0": [{"min": 0.0, "max": 1024.0, "value": 2.0}],
                "sd1": [{"min": 4096.0, "max": 5120.0, "value": 2.0}]
            })
        );
    }

    #[test]
    fn test_new_samples_are_skipped() {
        let q = CompiledQuery::compile(disk_ops(), Predicate::trivial(), &[]).unwrap();
        let prev = vec![snapshot(1, (1.0, 0.0), (0.0, 0.0)).remove(0)];
        let cur = snapshot(2, (3.0, 0.0), (50.0, 50.0));
        assert_eq!(q.evaluate(&cur, Some(&prev)), ReducedValue::Scalar(2.0));
    }

    #[test]
    fn test_interval_is_snaptime_difference() {
        let desc = MetricDescriptor::new("nic", "bytes", "bytes", "bytes")
            .with_extract(&[], |_, cur, prev, interval| {
                Some(cur.delta(prev, "obytes64") / interval.as_secs_f64())
            });
        let q = CompiledQuery::compile(Arc::new(desc), Predicate::trivial(), &[]).unwrap();
        let prev = vec![Sample::new("e1000g0", 0).with_counter("obytes64", 0.0)];
        let cur = vec![Sample::new("e1000g0", 4_000_000_000).with_counter("obytes64", 800.0)];
        assert_eq!(q.evaluate(&cur, Some(&prev)), ReducedValue::Scalar(200.0));
        assert_eq!(cur[0].interval_since(&prev[0]), Duration::from_secs(4));
    }

    #[test]
    fn test_validation_errors() {
        let d = disk_ops();
        let arity = |f: &str| d.arity_of(f);
        assert!(matches!(
            validate_request("disk", "physio_ops", &Predicate::trivial(), &["zone".into()], arity),
            Err(MetricError::UnknownField { .. })
        ));
        assert!(matches!(
            validate_request("disk", "physio_ops", &Predicate::trivial(), &["disk".into(), "disk".into()], arity),
            Err(MetricError::DuplicateDecomposition { .. })
        ));
        assert!(validate_request("disk", "physio_ops", &Predicate::trivial(), &["size".into(), "optype".into()], arity).is_ok());
    }

    #[test]
    fn test_degenerate_bucketizer_is_rejected() {
        let desc = MetricDescriptor::new("disk", "latency", "latency", "ops").field(FieldSpec::numeric(
            "latency",
            "latency",
            Bucketizer::linear(0.0),
            |_, _, _| vec![FieldValue::Number(1.0)],
        ));
        let err = CompiledQuery::compile(Arc::new(desc), Predicate::trivial(), &["latency".into()]).unwrap_err();
        assert_eq!(
            err,
            MetricError::InvalidBucketizer {
                field: "latency".into()
            }
        );
    }

    #[test]
    fn test_order_decomposition() {
        let d = disk_ops();
        let ordered = order_decomposition(&["size".into(), "disk".into(), "optype".into()], |f| d.arity_of(f));
        assert_eq!(ordered, vec!["disk", "optype", "size"]);
    }
}
