//! # ps-parallel
//!
//! Execution substrates for parameter sweeps behind one contract,
//! [`ParallelBackend`]: deterministic scatter of a work list, block execution,
//! and the collectives (gather, all-gather, broadcast, all-reduce, barrier)
//! the orchestrator needs to assemble results in global item order.
//!
//! Backends:
//! - [`SerialBackend`]: the calling thread.
//! - [`ProcessPoolBackend`]: a dedicated rayon thread pool.
//! - [`FuturesPoolBackend`]: blocking tasks on a private tokio runtime.
//! - [`TaskRuntimeBackend`]: a retrying task queue with descriptor bookkeeping.
//! - [`MessagePassingBackend`]: SPMD ranks launched by [`MessagePassingWorld`].

mod backend;
mod futures_pool;
mod message_passing;
mod partition;
mod pooled;
mod process_pool;
mod serial;
mod task_runtime;

pub use backend::{ParallelBackend, ReduceOp, Reducible};
pub use futures_pool::FuturesPoolBackend;
pub use message_passing::{MessagePassingBackend, MessagePassingWorld};
pub use partition::{BlockOutput, LocalShare, PartitionPlan, ShareResults, WorkBlock};
pub use pooled::Backend;
pub use process_pool::ProcessPoolBackend;
pub use serial::SerialBackend;
pub use task_runtime::{TaskDescriptor, TaskRuntimeBackend, TaskRuntimeStats};
