// ============================================================================
// CARTESIAN EXPANSION
// ============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use super::descriptor::FieldSpec;
use super::{FieldValue, Sample};

/// Field name → value for one data point
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Data points for one sample pair: the cartesian product of each field's
/// values
pub fn expand(fields: &[&FieldSpec], cur: &Sample, prev: &Sample, interval: Duration) -> Vec<FieldMap> {
    let columns: Vec<(&str, Vec<FieldValue>)> = fields
        .iter()
        .map(|f| (f.name.as_str(), (f.values)(cur, prev, interval)))
        .collect();
    cartesian(columns)
}

/// Cartesian product over named value lists. No columns yield one empty map;
/// a column with no values yields nothing.
pub fn cartesian(mut columns: Vec<(&str, Vec<FieldValue>)>) -> Vec<FieldMap> {
    if columns.is_empty() {
        return vec![FieldMap::new()];
    }

    let (name, values) = columns.remove(0);

    if columns.is_empty() {
        return values
            .into_iter()
            .map(|v| {
                let mut map = FieldMap::new();
                map.insert(name.to_string(), v);
                map
            })
            .collect();
    }

    let tail = cartesian(columns);
    let mut out = Vec::with_capacity(tail.len() * values.len());

    for mut map in tail {
        let Some((last, rest)) = values.split_last() else {
            break;
        };
        for v in rest {
            let mut copy = map.clone();
            copy.insert(name.to_string(), v.clone());
            out.push(copy);
        }
        // The last value reuses the tail's map
        map.insert(name.to_string(), last.clone());
        out.push(map);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn texts(values: &[&str]) -> Vec<FieldValue> {
        values.iter().map(|v| FieldValue::from(*v)).collect()
    }

    #[test]
    fn test_two_by_three() {
        let points = cartesian(vec![
            ("optype", texts(&["read", "write"])),
            ("disk", texts(&["sd0", "sd1", "sd2"])),
        ]);
        assert_eq!(points.len(), 6);
        assert!(points.iter().all(|p| p.len() == 2));

        let mut pairs: Vec<(String, String)> = points
            .iter()
            .map(|p| (p["optype"].to_string(), p["disk"].to_string()))
            .collect();
        pairs.sort();
        pairs.dedup();
        assert_eq!(pairs.len(), 6);
    }

    #[test]
    fn test_empty_field_yields_nothing() {
        let points = cartesian(vec![
            ("optype", texts(&["read", "write"])),
            ("disk", Vec::new()),
        ]);
        assert!(points.is_empty());
    }

    #[test]
    fn test_no_fields_yields_one_point() {
        assert_eq!(cartesian(Vec::new()), vec![FieldMap::new()]);
    }

    #[test]
    fn test_maps_are_independent() {
        let mut points = cartesian(vec![("a", texts(&["x", "y"])), ("b", texts(&["z"]))]);
        points[0].insert("a".into(), FieldValue::from("changed"));
        assert_eq!(points[1]["a"], FieldValue::from("y"));
    }

    proptest! {
        #[test]
        fn prop_cardinality_is_product(sizes in proptest::collection::vec(0usize..4, 1..5)) {
            let names: Vec<String> = (0..sizes.len()).map(|i| format!("f{}", i)).collect();
            let columns: Vec<(&str, Vec<FieldValue>)> = names
                .iter()
                .zip(&sizes)
                .map(|(n, &k)| (n.as_str(), (0..k).map(|v| FieldValue::Number(v as f64)).collect()))
                .collect();
            let expected: usize = sizes.iter().product();
            let points = cartesian(columns);
            prop_assert_eq!(points.len(), expected);
            prop_assert!(points.iter().all(|p| p.len() == sizes.len()));
        }
    }
}
