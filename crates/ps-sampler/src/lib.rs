//! # ps-sampler
//!
//! Sample generation for parameter sweeps.
//!
//! Produces ordered [`SampleBlock`](ps_types::SampleBlock)s from declarative
//! [`SampleSpec`](ps_types::SampleSpec)s: fixed grids walked by a single flat
//! index, seeded draws from probability distributions, and optional Latin
//! hypercube stratification across every dimension. Randomness comes from an
//! explicit [`SampleStream`] so that recursive sweeps can continue the same
//! stream across passes.

mod latin;
mod quantile;
mod sampler;
mod stream;

pub use latin::{latin_hypercube_strata, stratum_of};
pub use quantile::inverse_normal_cdf;
pub use sampler::{differential_spec, generate, Sampler};
pub use stream::SampleStream;
