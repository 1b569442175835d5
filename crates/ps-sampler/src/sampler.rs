//! Sample block generation.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::debug;

use ps_types::{
    validate_specs, ConfigError, DifferentialSpec, PerturbationPlacement, SampleBlock, SampleKind,
    SampleSpec,
};

use crate::latin::{jittered_unit, latin_hypercube_strata};
use crate::quantile::quantile;
use crate::stream::SampleStream;

/// Generates sample blocks from a set of specs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sampler {
    latin_hypercube: bool,
}

impl Sampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latin_hypercube(mut self, enabled: bool) -> Self {
        self.latin_hypercube = enabled;
        self
    }

    pub fn latin_hypercube(&self) -> bool {
        self.latin_hypercube
    }

    /// Draw `count` tuples, advancing `stream`.
    ///
    /// Fixed dimensions contribute their `i`-th grid point to sample `i`.
    /// Random dimensions draw `count` values each, in declaration order, so a
    /// given stream position always yields the same block.
    pub fn generate(
        &self,
        specs: &[SampleSpec],
        count: usize,
        stream: &mut SampleStream,
    ) -> Result<SampleBlock, ConfigError> {
        validate_specs(specs, count)?;

        let strata = if self.latin_hypercube {
            latin_hypercube_strata(count, specs.len(), stream)
        } else {
            Vec::new()
        };

        let mut columns = Vec::with_capacity(specs.len());
        for (dim, spec) in specs.iter().enumerate() {
            let column = match strata.get(dim) {
                Some(order) => stratified_column(spec, order, stream)?,
                None => plain_column(spec, count, stream)?,
            };
            columns.push(column);
        }

        let keys: Vec<String> = specs.iter().map(|s| s.key.clone()).collect();
        let rows = (0..count)
            .map(|i| columns.iter().map(|col| col[i]).collect())
            .collect();

        debug!(
            dims = specs.len(),
            count,
            latin_hypercube = self.latin_hypercube,
            "generated sample block"
        );
        Ok(SampleBlock::with_rows(keys, rows))
    }
}

/// Convenience wrapper: one block from a fresh stream.
pub fn generate(
    specs: &[SampleSpec],
    count: usize,
    seed: Option<u64>,
) -> Result<SampleBlock, ConfigError> {
    Sampler::new().generate(specs, count, &mut SampleStream::new(seed))
}

fn grid_point(kind: &SampleKind, i: usize) -> f64 {
    match kind {
        SampleKind::Linear { lower, upper, count } => {
            if *count <= 1 {
                *lower
            } else if i + 1 == *count {
                *upper
            } else {
                lower + (upper - lower) * i as f64 / (*count - 1) as f64
            }
        }
        SampleKind::Geometric { lower, upper, count } => {
            if *count <= 1 {
                *lower
            } else if i + 1 == *count {
                *upper
            } else {
                let (lo, hi) = (lower.ln(), upper.ln());
                (lo + (hi - lo) * i as f64 / (*count - 1) as f64).exp()
            }
        }
        SampleKind::Predetermined { values } => values[i],
        _ => unreachable!("grid_point called on a random kind"),
    }
}

fn plain_column(
    spec: &SampleSpec,
    count: usize,
    stream: &mut SampleStream,
) -> Result<Vec<f64>, ConfigError> {
    if spec.kind.is_fixed() {
        return Ok((0..count).map(|i| grid_point(&spec.kind, i)).collect());
    }

    let rng = stream.rng();
    let column = match &spec.kind {
        SampleKind::Uniform { lower, upper } => {
            (0..count).map(|_| rng.gen_range(*lower..*upper)).collect()
        }
        SampleKind::LogUniform { lower, upper } => {
            let (lo, hi) = (lower.ln(), upper.ln());
            (0..count).map(|_| rng.gen_range(lo..hi).exp()).collect()
        }
        SampleKind::Normal { mean, std_dev } => {
            let normal = Normal::new(*mean, *std_dev).map_err(|e| ConfigError::InvalidDistribution {
                key: spec.key.clone(),
                message: e.to_string(),
            })?;
            (0..count).map(|_| normal.sample(rng)).collect()
        }
        SampleKind::RandomChoice { values } => (0..count)
            .map(|_| values[rng.gen_range(0..values.len())])
            .collect(),
        SampleKind::Linear { .. } | SampleKind::Geometric { .. } | SampleKind::Predetermined { .. } => {
            unreachable!("fixed kinds handled above")
        }
    };
    Ok(column)
}

fn stratified_column(
    spec: &SampleSpec,
    order: &[usize],
    stream: &mut SampleStream,
) -> Result<Vec<f64>, ConfigError> {
    let count = order.len();
    if spec.kind.is_fixed() {
        return Ok(order.iter().map(|&s| grid_point(&spec.kind, s)).collect());
    }
    order
        .iter()
        .map(|&stratum| {
            let u = jittered_unit(stratum, count, stream);
            quantile(&spec.kind, u).ok_or_else(|| ConfigError::InvalidDistribution {
                key: spec.key.clone(),
                message: "kind cannot be stratified".to_string(),
            })
        })
        .collect()
}

/// One-dimensional spec for the perturbations of `diff.key` around `nominal`.
///
/// Linear placement spans `[nominal - d, nominal + d]`; a single perturbed
/// sample sits at `nominal + d`. When the interval collapses to the nominal
/// value (a zero half-width, or one below the spacing of floats near
/// `nominal`) every perturbed sample repeats it.
pub fn differential_spec(nominal: f64, diff: &DifferentialSpec) -> SampleSpec {
    let half = diff.perturbation.half_width(nominal);
    let (lower, upper) = (nominal - half, nominal + half);
    let kind = if lower >= upper {
        SampleKind::Predetermined {
            values: vec![nominal; diff.count],
        }
    } else if diff.count == 1 {
        SampleKind::Predetermined { values: vec![upper] }
    } else {
        match diff.placement {
            PerturbationPlacement::Linear => SampleKind::Linear {
                lower,
                upper,
                count: diff.count,
            },
            PerturbationPlacement::Uniform => SampleKind::Uniform { lower, upper },
        }
    };
    SampleSpec::new(diff.key.clone(), kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latin::stratum_of;

    fn three_linear() -> Vec<SampleSpec> {
        vec![
            SampleSpec::linear("a", 0.0, 3.0, 4),
            SampleSpec::linear("b", 10.0, 40.0, 4),
            SampleSpec::linear("c", -1.0, 1.0, 4),
        ]
    }

    #[test]
    fn linear_walk_is_not_cartesian() {
        let block = generate(&three_linear(), 4, Some(1)).unwrap();
        assert_eq!(block.len(), 4);
        assert_eq!(block.rows[0], vec![0.0, 10.0, -1.0]);
        assert_eq!(block.rows[3], vec![3.0, 40.0, 1.0]);
        assert_eq!(block.column("a").unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn geometric_grid_endpoints_and_ratio() {
        let specs = vec![SampleSpec::geometric("g", 1.0, 1000.0, 4)];
        let col = generate(&specs, 4, None).unwrap().column("g").unwrap();
        assert_eq!(col[0], 1.0);
        assert_eq!(col[3], 1000.0);
        assert!((col[1] - 10.0).abs() < 1e-9);
        assert!((col[2] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn block_length_matches_count_for_every_kind() {
        let specs = vec![
            SampleSpec::uniform("u", -10.0, 0.0),
            SampleSpec::normal("n", 10.0, 5.0),
            SampleSpec::log_uniform("l", 1e-3, 1e3),
            SampleSpec::random_choice("r", vec![1.0, 2.0, 3.0]),
            SampleSpec::predetermined("p", (0..25).map(f64::from).collect()),
        ];
        for lhs in [false, true] {
            let block = Sampler::new()
                .with_latin_hypercube(lhs)
                .generate(&specs, 25, &mut SampleStream::seeded(2))
                .unwrap();
            assert_eq!(block.len(), 25);
            assert!(block.rows.iter().all(|r| r.len() == specs.len()));
        }
    }

    #[test]
    fn random_draws_respect_bounds() {
        let specs = vec![
            SampleSpec::uniform("a", -10.0, 0.0),
            SampleSpec::uniform("b", 0.0, 10.0),
            SampleSpec::log_uniform("c", 0.1, 10.0),
        ];
        let block = generate(&specs, 2000, Some(4)).unwrap();
        assert!(block.column("a").unwrap().iter().all(|v| (-10.0..0.0).contains(v)));
        assert!(block.column("b").unwrap().iter().all(|v| (0.0..10.0).contains(v)));
        assert!(block.column("c").unwrap().iter().all(|v| (0.1..10.0).contains(v)));
    }

    #[test]
    fn normal_mean_is_plausible() {
        let specs = vec![SampleSpec::normal("n", 100.0, 50.0)];
        let col = generate(&specs, 20_000, Some(8)).unwrap().column("n").unwrap();
        let mean = col.iter().sum::<f64>() / col.len() as f64;
        assert!((mean - 100.0).abs() < 5.0, "mean {mean}");
    }

    #[test]
    fn seeded_generation_is_reproducible() {
        let specs = vec![
            SampleSpec::uniform("a", 0.0, 1.0),
            SampleSpec::normal("b", 0.0, 1.0),
        ];
        for lhs in [false, true] {
            let sampler = Sampler::new().with_latin_hypercube(lhs);
            let x = sampler.generate(&specs, 50, &mut SampleStream::seeded(42)).unwrap();
            let y = sampler.generate(&specs, 50, &mut SampleStream::seeded(42)).unwrap();
            assert_eq!(x, y);
        }
        let x = generate(&specs, 50, Some(1)).unwrap();
        let y = generate(&specs, 50, Some(2)).unwrap();
        assert_ne!(x, y);
    }

    #[test]
    fn continued_stream_differs_from_fresh_stream() {
        let specs = vec![SampleSpec::uniform("a", 0.0, 1.0)];
        let sampler = Sampler::new();
        let mut stream = SampleStream::seeded(42);
        let first = sampler.generate(&specs, 5, &mut stream).unwrap();
        let second = sampler.generate(&specs, 5, &mut stream).unwrap();
        assert_ne!(first, second);

        let mut replay = SampleStream::seeded(42);
        let _ = sampler.generate(&specs, 5, &mut replay).unwrap();
        assert_eq!(sampler.generate(&specs, 5, &mut replay).unwrap(), second);
    }

    #[test]
    fn latin_hypercube_uses_every_stratum_once() {
        let count = 40;
        let specs = vec![
            SampleSpec::uniform("a", 0.0, 1.0),
            SampleSpec::uniform("b", -5.0, 5.0),
            SampleSpec::log_uniform("c", 1.0, 100.0),
        ];
        let block = Sampler::new()
            .with_latin_hypercube(true)
            .generate(&specs, count, &mut SampleStream::seeded(17))
            .unwrap();

        let to_unit: [Box<dyn Fn(f64) -> f64>; 3] = [
            Box::new(|v: f64| v),
            Box::new(|v: f64| (v + 5.0) / 10.0),
            Box::new(|v: f64| v.ln() / 100f64.ln()),
        ];
        for (dim, unit) in to_unit.iter().enumerate() {
            let mut strata: Vec<usize> = block
                .rows
                .iter()
                .map(|row| stratum_of(unit(row[dim]), count))
                .collect();
            strata.sort_unstable();
            assert_eq!(strata, (0..count).collect::<Vec<_>>(), "dimension {dim}");
        }
    }

    #[test]
    fn latin_hypercube_permutes_fixed_grids() {
        let specs = vec![SampleSpec::linear("a", 0.0, 9.0, 10)];
        let block = Sampler::new()
            .with_latin_hypercube(true)
            .generate(&specs, 10, &mut SampleStream::seeded(3))
            .unwrap();
        let mut col = block.column("a").unwrap();
        col.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert_eq!(col, (0..10).map(f64::from).collect::<Vec<_>>());
    }

    #[test]
    fn mixed_fixed_and_random_specs() {
        let specs = vec![
            SampleSpec::linear("grid", 0.0, 1.0, 3),
            SampleSpec::uniform("draw", 5.0, 6.0),
        ];
        let block = generate(&specs, 3, Some(0)).unwrap();
        assert_eq!(block.column("grid").unwrap(), vec![0.0, 0.5, 1.0]);

        let err = generate(&specs, 4, Some(0)).unwrap_err();
        assert!(matches!(err, ConfigError::CountMismatch { .. }));
    }

    #[test]
    fn configuration_errors_before_sampling() {
        let specs = vec![SampleSpec::normal("n", 0.0, -1.0)];
        assert!(matches!(
            generate(&specs, 3, Some(0)),
            Err(ConfigError::InvalidDistribution { .. })
        ));
        assert_eq!(
            generate(&[SampleSpec::uniform("u", 0.0, 1.0)], 0, None),
            Err(ConfigError::ZeroCount)
        );
    }

    #[test]
    fn overflowing_uniform_span_is_a_config_error() {
        let specs = vec![SampleSpec::uniform("x", -1e308, 1e308)];
        for latin in [false, true] {
            let err = Sampler::new()
                .with_latin_hypercube(latin)
                .generate(&specs, 4, &mut SampleStream::new(Some(3)))
                .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidDistribution { .. }));
        }
    }

    #[test]
    fn sub_ulp_perturbation_repeats_nominal() {
        let nominal = 1.5e17;
        for placement in [PerturbationPlacement::Linear, PerturbationPlacement::Uniform] {
            let diff = DifferentialSpec::absolute("x", 1.0, 3).with_placement(placement);
            let spec = differential_spec(nominal, &diff);
            assert_eq!(spec.kind, SampleKind::Predetermined { values: vec![nominal; 3] });
            assert!(generate(&[spec], 3, Some(0)).is_ok());
        }
    }

    #[test]
    fn differential_spec_shapes() {
        let linear = differential_spec(10.0, &DifferentialSpec::absolute("x", 1.0, 3));
        let block = generate(&[linear], 3, None).unwrap();
        assert_eq!(block.column("x").unwrap(), vec![9.0, 10.0, 11.0]);

        let single = differential_spec(10.0, &DifferentialSpec::relative("x", 0.1, 1));
        assert_eq!(single.kind, SampleKind::Predetermined { values: vec![11.0] });

        let zero = differential_spec(0.0, &DifferentialSpec::relative("x", 0.1, 2));
        assert_eq!(zero.kind, SampleKind::Predetermined { values: vec![0.0, 0.0] });

        let uniform = differential_spec(
            1.0,
            &DifferentialSpec::absolute("x", 0.5, 4).with_placement(PerturbationPlacement::Uniform),
        );
        let col = generate(&[uniform], 4, Some(1)).unwrap().column("x").unwrap();
        assert!(col.iter().all(|v| (0.5..1.5).contains(v)));
    }
}
