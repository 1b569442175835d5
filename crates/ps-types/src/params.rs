//! Sweep dimensions and the sample blocks drawn from them.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::errors::ConfigError;

/// Normal draws are treated as bounded this many standard deviations from
/// the mean when checking that derived values stay finite.
pub const NORMAL_TAIL_SIGMAS: f64 = 40.0;

/// How a single sweep dimension is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SampleKind {
    /// Evenly spaced grid over `[lower, upper]`, both ends included.
    Linear { lower: f64, upper: f64, count: usize },
    /// Log-spaced grid over `[lower, upper]`; both bounds must be positive.
    Geometric { lower: f64, upper: f64, count: usize },
    /// Explicit list of values, walked by sample index.
    Predetermined { values: Vec<f64> },
    /// Uniform draws from a fixed list of candidate values.
    RandomChoice { values: Vec<f64> },
    /// Draws whose logarithm is uniform over `[ln lower, ln upper)`.
    LogUniform { lower: f64, upper: f64 },
    /// Gaussian draws.
    Normal { mean: f64, std_dev: f64 },
    /// Uniform draws over `[lower, upper)`.
    Uniform { lower: f64, upper: f64 },
}

impl SampleKind {
    /// Grid-like kinds carry their own count and are walked by index.
    pub fn is_fixed(&self) -> bool {
        matches!(
            self,
            Self::Linear { .. } | Self::Geometric { .. } | Self::Predetermined { .. }
        )
    }

    pub fn is_random(&self) -> bool {
        !self.is_fixed()
    }

    /// Number of points a fixed kind produces; `None` for random kinds.
    pub fn fixed_count(&self) -> Option<usize> {
        match self {
            Self::Linear { count, .. } | Self::Geometric { count, .. } => Some(*count),
            Self::Predetermined { values } => Some(values.len()),
            _ => None,
        }
    }

    /// Largest magnitude any draw of this kind can take.
    pub fn magnitude_bound(&self) -> f64 {
        match self {
            Self::Linear { lower, upper, .. }
            | Self::Geometric { lower, upper, .. }
            | Self::LogUniform { lower, upper }
            | Self::Uniform { lower, upper } => lower.abs().max(upper.abs()),
            Self::Predetermined { values } | Self::RandomChoice { values } => {
                values.iter().fold(0.0, |acc, v| acc.max(v.abs()))
            }
            Self::Normal { mean, std_dev } => mean.abs() + NORMAL_TAIL_SIGMAS * std_dev,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Linear { .. } => "linear",
            Self::Geometric { .. } => "geometric",
            Self::Predetermined { .. } => "predetermined",
            Self::RandomChoice { .. } => "random-fixed",
            Self::LogUniform { .. } => "random-distribution",
            Self::Normal { .. } => "normal",
            Self::Uniform { .. } => "uniform",
        }
    }
}

/// A serializable sweep dimension: a stable key plus its sampling rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSpec {
    pub key: String,
    #[serde(flatten)]
    pub kind: SampleKind,
}

impl SampleSpec {
    pub fn new(key: impl Into<String>, kind: SampleKind) -> Self {
        Self {
            key: key.into(),
            kind,
        }
    }

    pub fn linear(key: impl Into<String>, lower: f64, upper: f64, count: usize) -> Self {
        Self::new(key, SampleKind::Linear { lower, upper, count })
    }

    pub fn geometric(key: impl Into<String>, lower: f64, upper: f64, count: usize) -> Self {
        Self::new(key, SampleKind::Geometric { lower, upper, count })
    }

    pub fn predetermined(key: impl Into<String>, values: Vec<f64>) -> Self {
        Self::new(key, SampleKind::Predetermined { values })
    }

    pub fn random_choice(key: impl Into<String>, values: Vec<f64>) -> Self {
        Self::new(key, SampleKind::RandomChoice { values })
    }

    pub fn log_uniform(key: impl Into<String>, lower: f64, upper: f64) -> Self {
        Self::new(key, SampleKind::LogUniform { lower, upper })
    }

    pub fn normal(key: impl Into<String>, mean: f64, std_dev: f64) -> Self {
        Self::new(key, SampleKind::Normal { mean, std_dev })
    }

    pub fn uniform(key: impl Into<String>, lower: f64, upper: f64) -> Self {
        Self::new(key, SampleKind::Uniform { lower, upper })
    }

    /// Check the distribution parameters of this one dimension.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidDistribution {
            key: self.key.clone(),
            message: message.to_string(),
        };

        match &self.kind {
            SampleKind::Linear { lower, upper, count } => {
                if !lower.is_finite() || !upper.is_finite() {
                    return Err(invalid("bounds must be finite"));
                }
                if !(upper - lower).is_finite() {
                    return Err(invalid("bound span overflows"));
                }
                if *count == 0 {
                    return Err(ConfigError::ZeroCount);
                }
            }
            SampleKind::Geometric { lower, upper, count } => {
                if !(lower.is_finite() && upper.is_finite() && *lower > 0.0 && *upper > 0.0) {
                    return Err(invalid("geometric bounds must be finite and positive"));
                }
                if *count == 0 {
                    return Err(ConfigError::ZeroCount);
                }
            }
            SampleKind::Predetermined { values } | SampleKind::RandomChoice { values } => {
                if values.is_empty() {
                    return Err(invalid("value list is empty"));
                }
                if values.iter().any(|v| !v.is_finite()) {
                    return Err(invalid("value list contains non-finite entries"));
                }
            }
            SampleKind::LogUniform { lower, upper } => {
                if !(lower.is_finite() && upper.is_finite() && *lower > 0.0) {
                    return Err(invalid("log-uniform bounds must be finite and positive"));
                }
                if lower >= upper {
                    return Err(invalid("lower bound must be below upper bound"));
                }
            }
            SampleKind::Normal { mean, std_dev } => {
                if !mean.is_finite() {
                    return Err(invalid("mean must be finite"));
                }
                if !std_dev.is_finite() || *std_dev <= 0.0 {
                    return Err(invalid("standard deviation must be positive"));
                }
                if !self.kind.magnitude_bound().is_finite() {
                    return Err(invalid("standard deviation too large for finite draws"));
                }
            }
            SampleKind::Uniform { lower, upper } => {
                if !lower.is_finite() || !upper.is_finite() {
                    return Err(invalid("bounds must be finite"));
                }
                if lower >= upper {
                    return Err(invalid("lower bound must be below upper bound"));
                }
                if !(upper - lower).is_finite() {
                    return Err(invalid("bound span overflows"));
                }
            }
        }
        Ok(())
    }
}

/// Validate a full spec set against a requested sample count.
///
/// Rejects empty sets, duplicate keys, a zero count, malformed distributions
/// and fixed dimensions whose point count disagrees with `count`.
pub fn validate_specs(specs: &[SampleSpec], count: usize) -> Result<(), ConfigError> {
    if specs.is_empty() {
        return Err(ConfigError::NoParameters);
    }
    if count == 0 {
        return Err(ConfigError::ZeroCount);
    }

    let mut seen = HashSet::new();
    for spec in specs {
        if !seen.insert(spec.key.as_str()) {
            return Err(ConfigError::DuplicateKey {
                key: spec.key.clone(),
            });
        }
        spec.validate()?;
        if let Some(actual) = spec.kind.fixed_count() {
            if actual != count {
                return Err(ConfigError::CountMismatch {
                    key: spec.key.clone(),
                    expected: count,
                    actual,
                });
            }
        }
    }
    Ok(())
}

/// Writes a drawn scalar into the opaque model.
pub type ApplyFn<M> = Arc<dyn Fn(&mut M, f64) + Send + Sync>;

/// A sweep dimension bound to the model it mutates.
pub struct SweepParameter<M> {
    pub spec: SampleSpec,
    pub apply: ApplyFn<M>,
}

impl<M> SweepParameter<M> {
    pub fn new<F>(spec: SampleSpec, apply: F) -> Self
    where
        F: Fn(&mut M, f64) + Send + Sync + 'static,
    {
        Self {
            spec,
            apply: Arc::new(apply),
        }
    }

    pub fn key(&self) -> &str {
        &self.spec.key
    }
}

impl<M> Clone for SweepParameter<M> {
    fn clone(&self) -> Self {
        Self {
            spec: self.spec.clone(),
            apply: Arc::clone(&self.apply),
        }
    }
}

impl<M> fmt::Debug for SweepParameter<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SweepParameter")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Ordered parameter tuples, one per planned run.
///
/// Keys are stored once; every row is aligned to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBlock {
    pub keys: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl SampleBlock {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(keys: Vec<String>, rows: Vec<Vec<f64>>) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == keys.len()));
        Self { keys, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn key_index(&self, key: &str) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    /// Value of `key` in row `row`.
    pub fn value(&self, row: usize, key: &str) -> Option<f64> {
        let col = self.key_index(key)?;
        self.rows.get(row).map(|r| r[col])
    }

    /// All values of one dimension in sample order.
    pub fn column(&self, key: &str) -> Option<Vec<f64>> {
        let col = self.key_index(key)?;
        Some(self.rows.iter().map(|r| r[col]).collect())
    }

    pub fn push(&mut self, row: Vec<f64>) {
        debug_assert_eq!(row.len(), self.keys.len());
        self.rows.push(row);
    }

    /// Append another block with the same keys.
    pub fn extend(&mut self, other: SampleBlock) {
        debug_assert_eq!(self.keys, other.keys);
        self.rows.extend(other.rows);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_kinds_report_counts() {
        assert_eq!(SampleSpec::linear("a", 0.0, 1.0, 4).kind.fixed_count(), Some(4));
        assert_eq!(
            SampleSpec::predetermined("b", vec![1.0, 2.0]).kind.fixed_count(),
            Some(2)
        );
        assert_eq!(SampleSpec::uniform("c", 0.0, 1.0).kind.fixed_count(), None);
        assert!(SampleSpec::normal("d", 0.0, 1.0).kind.is_random());
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let specs = vec![
            SampleSpec::linear("a", 0.0, 1.0, 4),
            SampleSpec::linear("b", 0.0, 1.0, 5),
        ];
        let err = validate_specs(&specs, 4).unwrap_err();
        assert_eq!(
            err,
            ConfigError::CountMismatch {
                key: "b".into(),
                expected: 4,
                actual: 5
            }
        );
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let specs = vec![
            SampleSpec::uniform("a", 0.0, 1.0),
            SampleSpec::normal("a", 0.0, 1.0),
        ];
        assert!(matches!(
            validate_specs(&specs, 3),
            Err(ConfigError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn malformed_distributions_are_rejected() {
        let bad = [
            SampleSpec::normal("n", 1.0, 0.0),
            SampleSpec::normal("n", 1.0, -2.0),
            SampleSpec::uniform("u", 2.0, 1.0),
            SampleSpec::geometric("g", 0.0, 1.0, 3),
            SampleSpec::log_uniform("l", -1.0, 1.0),
            SampleSpec::random_choice("r", vec![]),
        ];
        for spec in bad {
            assert!(
                matches!(spec.validate(), Err(ConfigError::InvalidDistribution { .. })),
                "{spec:?} should be invalid"
            );
        }
    }

    #[test]
    fn overflowing_spans_are_rejected() {
        let wide = [
            SampleSpec::uniform("u", -1e308, 1e308),
            SampleSpec::linear("l", -1e308, 1e308, 3),
            SampleSpec::normal("n", 0.0, 1e307),
        ];
        for spec in wide {
            assert!(
                matches!(spec.validate(), Err(ConfigError::InvalidDistribution { .. })),
                "{spec:?} should be invalid"
            );
        }
        assert!(SampleSpec::uniform("u", -1e307, 1e307).validate().is_ok());
        assert!(SampleSpec::linear("l", 1e308, -1e300, 3).validate().is_ok());
    }

    #[test]
    fn magnitude_bound_covers_every_draw() {
        assert_eq!(SampleSpec::uniform("u", -3.0, 2.0).kind.magnitude_bound(), 3.0);
        assert_eq!(
            SampleSpec::predetermined("p", vec![1.0, -7.5, 4.0]).kind.magnitude_bound(),
            7.5
        );
        assert_eq!(
            SampleSpec::normal("n", -1.0, 0.5).kind.magnitude_bound(),
            1.0 + NORMAL_TAIL_SIGMAS * 0.5
        );
    }

    #[test]
    fn zero_count_and_empty_specs() {
        assert_eq!(
            validate_specs(&[SampleSpec::uniform("a", 0.0, 1.0)], 0),
            Err(ConfigError::ZeroCount)
        );
        assert_eq!(validate_specs(&[], 3), Err(ConfigError::NoParameters));
    }

    #[test]
    fn spec_serde_uses_kind_tag() {
        let spec = SampleSpec::linear("flow", 1.0, 2.0, 3);
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["kind"], "linear");
        assert_eq!(json["key"], "flow");
        let back: SampleSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn block_column_access() {
        let block = SampleBlock::with_rows(
            vec!["a".into(), "b".into()],
            vec![vec![1.0, 2.0], vec![3.0, 4.0]],
        );
        assert_eq!(block.len(), 2);
        assert_eq!(block.column("b"), Some(vec![2.0, 4.0]));
        assert_eq!(block.value(1, "a"), Some(3.0));
        assert_eq!(block.value(0, "missing"), None);
    }

    #[test]
    fn sweep_parameter_applies_to_model() {
        let param = SweepParameter::new(SampleSpec::uniform("x", 0.0, 1.0), |m: &mut Vec<f64>, v| {
            m.push(v)
        });
        let mut model = Vec::new();
        (param.apply)(&mut model, 0.25);
        assert_eq!(model, vec![0.25]);
        assert_eq!(param.key(), "x");
    }
}
