//! Inverse CDFs used to map stratified unit values onto distributions.

use ps_types::SampleKind;

// Acklam's rational approximation coefficients.
const A: [f64; 6] = [
    -3.969683028665376e+01,
    2.209460984245205e+02,
    -2.759285104469687e+02,
    1.383577518672690e+02,
    -3.066479806614716e+01,
    2.506628277459239e+00,
];
const B: [f64; 5] = [
    -5.447609879822406e+01,
    1.615858368580409e+02,
    -1.556989798598866e+02,
    6.680131188771972e+01,
    -1.328068155288572e+01,
];
const C: [f64; 6] = [
    -7.784894002430293e-03,
    -3.223964580411365e-01,
    -2.400758277161838e+00,
    -2.549732539343734e+00,
    4.374664141464968e+00,
    2.938163982698783e+00,
];
const D: [f64; 4] = [
    7.784695709041462e-03,
    3.224671290700398e-01,
    2.445134137142996e+00,
    3.754408661907416e+00,
];

const P_LOW: f64 = 0.02425;

/// Standard normal quantile, relative error below 1.2e-9 on `(0, 1)`.
pub fn inverse_normal_cdf(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

/// Map a unit value `u` in `[0, 1)` through the quantile function of a random
/// kind. Fixed kinds are stratified by grid index instead and return `None`.
pub(crate) fn quantile(kind: &SampleKind, u: f64) -> Option<f64> {
    // Keep the normal tails finite.
    let u = u.clamp(f64::EPSILON, 1.0 - f64::EPSILON);
    let value = match kind {
        SampleKind::Uniform { lower, upper } => lower + u * (upper - lower),
        SampleKind::LogUniform { lower, upper } => {
            let (lo, hi) = (lower.ln(), upper.ln());
            (lo + u * (hi - lo)).exp()
        }
        SampleKind::Normal { mean, std_dev } => mean + std_dev * inverse_normal_cdf(u),
        SampleKind::RandomChoice { values } => {
            let idx = ((u * values.len() as f64) as usize).min(values.len() - 1);
            values[idx]
        }
        SampleKind::Linear { .. } | SampleKind::Geometric { .. } | SampleKind::Predetermined { .. } => {
            return None
        }
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_quantile_known_points() {
        assert!(inverse_normal_cdf(0.5).abs() < 1e-9);
        assert!((inverse_normal_cdf(0.975) - 1.959963985).abs() < 1e-6);
        assert!((inverse_normal_cdf(0.025) + 1.959963985).abs() < 1e-6);
        assert!((inverse_normal_cdf(0.001) + 3.090232306).abs() < 1e-6);
        assert_eq!(inverse_normal_cdf(0.0), f64::NEG_INFINITY);
    }

    #[test]
    fn normal_quantile_is_monotone() {
        let mut last = f64::NEG_INFINITY;
        for i in 1..1000 {
            let x = inverse_normal_cdf(i as f64 / 1000.0);
            assert!(x > last);
            last = x;
        }
    }

    #[test]
    fn uniform_and_choice_quantiles() {
        let uniform = SampleKind::Uniform { lower: 2.0, upper: 4.0 };
        assert!((quantile(&uniform, 0.5).unwrap() - 3.0).abs() < 1e-12);

        let choice = SampleKind::RandomChoice {
            values: vec![10.0, 20.0, 30.0, 40.0],
        };
        assert_eq!(quantile(&choice, 0.0), Some(10.0));
        assert_eq!(quantile(&choice, 0.3), Some(20.0));
        assert_eq!(quantile(&choice, 0.99), Some(40.0));

        let grid = SampleKind::Linear { lower: 0.0, upper: 1.0, count: 2 };
        assert_eq!(quantile(&grid, 0.5), None);
    }
}
