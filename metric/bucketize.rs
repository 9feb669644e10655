// ============================================================================
// BUCKETIZERS & DISTRIBUTIONS
// ============================================================================
// A distribution is a set of half-open buckets [min, max) with accumulated
// weights. Bucketizers map a numeric field value to its bucket.
// ============================================================================

use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Distribution
// ----------------------------------------------------------------------------

/// One bucket as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub min: f64,
    pub max: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Bucket>", into = "Vec<Bucket>")]
pub struct Distribution {
    /// Keyed by bucket minimum: (bucket maximum, accumulated weight)
    buckets: BTreeMap<OrderedFloat<f64>, (f64, f64)>,
}

impl Distribution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `weight` to the bucket [min, max)
    pub fn add(&mut self, min: f64, max: f64, weight: f64) {
        let entry = self.buckets.entry(OrderedFloat(min)).or_insert((max, 0.0));
        entry.1 += weight;
    }

    pub fn merge(&mut self, other: &Distribution) {
        for (min, (max, weight)) in &other.buckets {
            self.add(min.0, *max, *weight);
        }
    }

    pub fn buckets(&self) -> impl Iterator<Item = Bucket> + '_ {
        self.buckets.iter().map(|(min, (max, value))| Bucket {
            min: min.0,
            max: *max,
            value: *value,
        })
    }

    /// Weight of the bucket starting at `min`
    pub fn weight_at(&self, min: f64) -> Option<f64> {
        self.buckets.get(&OrderedFloat(min)).map(|(_, w)| *w)
    }

    pub fn total(&self) -> f64 {
        self.buckets.values().map(|(_, w)| w).sum()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl From<Vec<Bucket>> for Distribution {
    fn from(buckets: Vec<Bucket>) -> Self {
        let mut dist = Distribution::new();
        for b in buckets {
            dist.add(b.min, b.max, b.value);
        }
        dist
    }
}

impl From<Distribution> for Vec<Bucket> {
    fn from(dist: Distribution) -> Self {
        dist.buckets().collect()
    }
}

// ----------------------------------------------------------------------------
// Bucketizers
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Bucketizer {
    /// Fixed-width buckets of `step`
    Linear { step: f64 },
    /// Linear steps within each power of `base` between `base^min_exp` and
    /// `base^max_exp`
    LogLinear {
        base: f64,
        min_exp: i32,
        max_exp: i32,
        steps: u32,
    },
}

impl Bucketizer {
    pub fn linear(step: f64) -> Self {
        Bucketizer::Linear { step }
    }

    pub fn log_linear(base: f64, min_exp: i32, max_exp: i32, steps: u32) -> Self {
        Bucketizer::LogLinear {
            base,
            min_exp,
            max_exp,
            steps,
        }
    }

    /// The bucket [min, max) containing `value`
    pub fn bucket(&self, value: f64) -> (f64, f64) {
        match *self {
            Bucketizer::Linear { step } => {
                let min = (value / step).floor() * step;
                (min, min + step)
            }
            Bucketizer::LogLinear {
                base,
                min_exp,
                max_exp,
                steps,
            } => {
                let low = base.powi(min_exp);
                let high = base.powi(max_exp);
                if value < low {
                    return (0.0, low);
                }
                if value >= high {
                    return (high, f64::INFINITY);
                }

                let mut magnitude = value.log(base).floor() as i32;
                // log() can land one off near exact powers
                if base.powi(magnitude) > value {
                    magnitude -= 1;
                } else if base.powi(magnitude + 1) <= value {
                    magnitude += 1;
                }

                let lower = base.powi(magnitude);
                let upper = base.powi(magnitude + 1);
                let width = upper / steps.max(1) as f64;
                // steps are laid out from `lower` so buckets never overlap
                // when `width` does not divide `lower`
                let min = lower + ((value - lower) / width).floor() * width;
                (min, (min + width).min(upper))
            }
        }
    }

    /// Add `weight` to the bucket containing `value`
    #[inline]
    pub fn bucketize(&self, dist: &mut Distribution, value: f64, weight: f64) {
        let (min, max) = self.bucket(value);
        dist.add(min, max, weight);
    }

    pub fn is_valid(&self) -> bool {
        match *self {
            Bucketizer::Linear { step } => step > 0.0 && step.is_finite(),
            Bucketizer::LogLinear {
                base,
                min_exp,
                max_exp,
                steps,
            } => base > 1.0 && min_exp < max_exp && steps > 0,
        }
    }
}
