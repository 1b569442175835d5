//! Latin hypercube stratification.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::stream::SampleStream;

/// Stratum assignment for `dims` dimensions over `count` samples.
///
/// Entry `[d][i]` is the stratum of dimension `d` used by sample `i`. Every
/// row is an independent permutation of `0..count`, so each stratum of each
/// dimension is used exactly once.
pub fn latin_hypercube_strata(count: usize, dims: usize, stream: &mut SampleStream) -> Vec<Vec<usize>> {
    (0..dims)
        .map(|_| {
            let mut strata: Vec<usize> = (0..count).collect();
            strata.shuffle(stream.rng());
            strata
        })
        .collect()
}

/// Unit value inside `stratum` of `count` equal-probability strata, jittered
/// uniformly within the stratum.
pub(crate) fn jittered_unit(stratum: usize, count: usize, stream: &mut SampleStream) -> f64 {
    let jitter: f64 = stream.rng().gen();
    (stratum as f64 + jitter) / count as f64
}

/// Stratum containing unit value `u` when `[0, 1)` is split into `count`
/// equal strata.
pub fn stratum_of(u: f64, count: usize) -> usize {
    ((u * count as f64).floor() as usize).min(count.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_row_is_a_permutation() {
        let mut stream = SampleStream::seeded(5);
        let strata = latin_hypercube_strata(17, 4, &mut stream);
        assert_eq!(strata.len(), 4);
        for row in &strata {
            let mut sorted = row.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, (0..17).collect::<Vec<_>>());
        }
    }

    #[test]
    fn jitter_stays_inside_stratum() {
        let mut stream = SampleStream::seeded(9);
        for stratum in 0..10 {
            let u = jittered_unit(stratum, 10, &mut stream);
            assert_eq!(stratum_of(u, 10), stratum);
        }
    }
}
