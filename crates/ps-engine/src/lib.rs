//! # ps-engine
//!
//! Run executor and sweep orchestrator for parasweep.
//!
//! An [`Experiment`] bundles the model callbacks with the swept parameters
//! and declared outputs. A [`SweepOrchestrator`] validates it against a
//! [`SweepConfig`](ps_types::SweepConfig) and runs the simple, recursive or
//! differential strategy on any [`ParallelBackend`](ps_parallel::ParallelBackend).

pub mod executor;
pub mod experiment;
pub mod orchestrator;
pub mod telemetry;

pub use executor::RunExecutor;
pub use experiment::{Experiment, SweepOutput};
pub use orchestrator::{run_message_passing, run_sweep, SweepOrchestrator, SweepOutcome, SweepPhase};
pub use telemetry::init_tracing;
