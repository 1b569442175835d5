//! Fill NaN outputs of failed runs from their nearest successful neighbours.

use tracing::{debug, info};

use ps_types::{OutputValue, SweepResult};

const TIE_TOLERANCE: f64 = 1e-9;

/// Per-dimension `(min, span)` over every run, with zero spans mapped to 1 so
/// constant dimensions contribute nothing to distances.
fn normalization(result: &SweepResult) -> Vec<(f64, f64)> {
    (0..result.parameter_keys.len())
        .map(|col| {
            let (lo, hi) = result
                .records
                .iter()
                .filter_map(|r| r.inputs.get(col).copied())
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
            let span = hi - lo;
            if span.is_finite() && span > 0.0 {
                (lo, span)
            } else {
                (0.0, 1.0)
            }
        })
        .collect()
}

fn distance(a: &[f64], b: &[f64], norm: &[(f64, f64)]) -> f64 {
    a.iter()
        .zip(b)
        .zip(norm)
        .map(|((x, y), (_, span))| {
            let d = (x - y) / span;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Replace NaN output entries of non-successful runs with the mean of the
/// nearest successful runs in range-normalized parameter space; runs at equal
/// distance are averaged. Run statuses are left untouched.
///
/// Returns the number of runs that had at least one entry written and marks
/// the metadata as interpolated when that number is positive.
pub fn interpolate_failures(result: &mut SweepResult) -> usize {
    let norm = normalization(result);
    let successes: Vec<(Vec<f64>, Vec<OutputValue>)> = result
        .successful()
        .map(|r| (r.inputs.clone(), r.outputs.clone()))
        .collect();
    if successes.is_empty() {
        debug!("no successful runs to interpolate from");
        return 0;
    }

    let mut filled = 0;
    for record in result.records.iter_mut().filter(|r| !r.is_success()) {
        if !record.outputs.iter().any(OutputValue::has_nan) {
            continue;
        }

        let distances: Vec<f64> = successes
            .iter()
            .map(|(inputs, _)| distance(&record.inputs, inputs, &norm))
            .collect();
        let nearest = distances.iter().copied().fold(f64::INFINITY, f64::min);
        let tolerance = TIE_TOLERANCE * nearest.max(1.0);
        let neighbours: Vec<&Vec<OutputValue>> = successes
            .iter()
            .zip(&distances)
            .filter(|(_, d)| (**d - nearest).abs() <= tolerance)
            .map(|((_, outputs), _)| outputs)
            .collect();

        let mut written = false;
        for (col, value) in record.outputs.iter_mut().enumerate() {
            let estimates = |elem: usize| {
                let (sum, n) = neighbours
                    .iter()
                    .filter_map(|outputs| outputs.get(col).and_then(|o| o.as_slice().get(elem)))
                    .filter(|v| !v.is_nan())
                    .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                (n > 0).then(|| sum / n as f64)
            };
            match value {
                OutputValue::Scalar(v) if v.is_nan() => {
                    if let Some(est) = estimates(0) {
                        *v = est;
                        written = true;
                    }
                }
                OutputValue::Array(values) => {
                    for (elem, v) in values.iter_mut().enumerate() {
                        if v.is_nan() {
                            if let Some(est) = estimates(elem) {
                                *v = est;
                                written = true;
                            }
                        }
                    }
                }
                OutputValue::Scalar(_) => {}
            }
        }
        if written {
            filled += 1;
        }
    }

    if filled > 0 {
        result.metadata.interpolated = true;
        info!("Interpolated outputs for {} failed runs", filled);
    }
    filled
}
