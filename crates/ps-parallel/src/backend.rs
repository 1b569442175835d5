//! The uniform backend contract.

use std::ops::Add;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use ps_types::{panic_message, BackendFault, BackendKind, PartitionScheme};

use crate::partition::{LocalShare, PartitionPlan, ShareResults};

/// Combining operation for [`ParallelBackend::all_reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

impl ReduceOp {
    pub fn apply<T: Reducible>(self, a: T, b: T) -> T {
        match self {
            Self::Sum => a + b,
            Self::Min => {
                if b < a {
                    b
                } else {
                    a
                }
            }
            Self::Max => {
                if b > a {
                    b
                } else {
                    a
                }
            }
        }
    }

    /// Fold a non-empty rank-ordered list.
    pub fn fold<T: Reducible>(self, values: Vec<T>) -> Option<T> {
        values.into_iter().reduce(|acc, v| self.apply(acc, v))
    }
}

/// Values that can be combined by [`ReduceOp`].
pub trait Reducible: Copy + PartialOrd + Add<Output = Self> + Send + Sync + 'static {}

impl<T> Reducible for T where T: Copy + PartialOrd + Add<Output = T> + Send + Sync + 'static {}

/// Execution substrate for a sweep.
///
/// `size` is the number of ranks taking part in collectives; `workers` is the
/// number of blocks a work list is split into. Message-passing backends run
/// one block per rank, pooled backends are a single coordinating rank that
/// drives a pool of workers. The default collective implementations cover the
/// single-rank case.
pub trait ParallelBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn workers(&self) -> usize;

    fn partition(&self) -> PartitionScheme;

    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Split `items` into `workers()` blocks and return the blocks this
    /// instance executes.
    fn scatter_work<T: Clone + Send + Sync + 'static>(&self, items: &[T]) -> LocalShare<T> {
        let plan = PartitionPlan::new(items.len(), self.workers(), self.partition());
        LocalShare::all_blocks(items, plan)
    }

    /// Run `f` once per block of `share`.
    fn execute<T, R, F>(&self, share: LocalShare<T>, f: F) -> Result<ShareResults<R>, BackendFault>
    where
        T: Send + Sync + 'static,
        R: Send + Sync + 'static,
        F: Fn(&[T]) -> Vec<R> + Send + Sync + 'static;

    /// Collect one value per rank on rank 0, in rank order.
    fn gather<T: Send + 'static>(&self, local: T) -> Result<Option<Vec<T>>, BackendFault> {
        Ok(Some(vec![local]))
    }

    fn all_gather<T: Clone + Send + 'static>(&self, local: T) -> Result<Vec<T>, BackendFault> {
        Ok(vec![local])
    }

    /// Deliver `value` from `root` to every rank. Only the root's value is
    /// read; other ranks pass `None`.
    fn broadcast<T: Clone + Send + 'static>(&self, value: Option<T>, root: usize) -> Result<T, BackendFault> {
        if root >= self.size() {
            return Err(BackendFault::Runtime(format!(
                "broadcast root {root} outside group of {}",
                self.size()
            )));
        }
        value.ok_or_else(|| BackendFault::PayloadMismatch {
            rank: root,
            operation: "broadcast".to_string(),
        })
    }

    fn all_reduce<T: Reducible>(&self, value: T, _op: ReduceOp) -> Result<T, BackendFault> {
        Ok(value)
    }

    fn barrier(&self) -> Result<(), BackendFault> {
        Ok(())
    }

    /// Gather executed results to rank 0 and restore global item order.
    fn gather_share<R: Send + 'static>(&self, results: ShareResults<R>) -> Result<Option<Vec<R>>, BackendFault> {
        let (plan, blocks) = results.into_parts();
        plan.reassemble(blocks).map(Some)
    }
}

/// Run one block, resubmitting it after a panic up to `max_retries` times.
pub(crate) fn run_with_retry<T, R, F>(
    block: usize,
    items: &[T],
    f: &F,
    max_retries: usize,
) -> Result<Vec<R>, BackendFault>
where
    F: Fn(&[T]) -> Vec<R> + ?Sized,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match catch_unwind(AssertUnwindSafe(|| f(items))) {
            Ok(results) => return Ok(results),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                if attempts <= max_retries {
                    warn!(block, attempts, %message, "worker block crashed, resubmitting");
                    continue;
                }
                error!(block, attempts, %message, "worker block crashed");
                return Err(BackendFault::WorkerCrashed {
                    block,
                    attempts,
                    message,
                });
            }
        }
    }
}
