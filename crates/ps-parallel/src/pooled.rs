//! Configuration-driven selection of a single-coordinator backend.

use tracing::info;

use ps_types::{BackendConfig, BackendFault, BackendKind, ConfigError, PartitionScheme, Result};

use crate::backend::{ParallelBackend, ReduceOp, Reducible};
use crate::futures_pool::FuturesPoolBackend;
use crate::partition::{LocalShare, ShareResults};
use crate::process_pool::ProcessPoolBackend;
use crate::serial::SerialBackend;
use crate::task_runtime::TaskRuntimeBackend;

/// Any backend that runs under a single coordinating rank.
///
/// Message passing is not constructible here: its ranks are provisioned by
/// [`MessagePassingWorld`](crate::MessagePassingWorld).
#[derive(Debug)]
pub enum Backend {
    Serial(SerialBackend),
    ProcessPool(ProcessPoolBackend),
    FuturesPool(FuturesPoolBackend),
    TaskRuntime(TaskRuntimeBackend),
}

impl Backend {
    pub fn from_config(config: &BackendConfig, partition: PartitionScheme) -> Result<Self> {
        config.validate()?;
        let backend = match config {
            BackendConfig::Serial => Self::Serial(SerialBackend::new().with_partition(partition)),
            BackendConfig::ProcessPool { workers, max_retries } => Self::ProcessPool(
                ProcessPoolBackend::new(*workers)?
                    .with_partition(partition)
                    .with_max_retries(*max_retries),
            ),
            BackendConfig::FuturesPool { workers, max_retries } => Self::FuturesPool(
                FuturesPoolBackend::new(*workers)?
                    .with_partition(partition)
                    .with_max_retries(*max_retries),
            ),
            BackendConfig::TaskRuntime(runtime) => {
                Self::TaskRuntime(TaskRuntimeBackend::new(runtime.clone())?.with_partition(partition))
            }
            BackendConfig::MessagePassing => {
                return Err(ConfigError::InvalidBackend {
                    message: "message-passing ranks are launched through MessagePassingWorld".to_string(),
                }
                .into())
            }
        };
        info!(backend = %backend.kind(), workers = backend.workers(), "backend ready");
        Ok(backend)
    }
}

macro_rules! delegate {
    ($self:ident, $b:ident => $body:expr) => {
        match $self {
            Backend::Serial($b) => $body,
            Backend::ProcessPool($b) => $body,
            Backend::FuturesPool($b) => $body,
            Backend::TaskRuntime($b) => $body,
        }
    };
}

impl ParallelBackend for Backend {
    fn kind(&self) -> BackendKind {
        delegate!(self, b => b.kind())
    }

    fn rank(&self) -> usize {
        delegate!(self, b => b.rank())
    }

    fn size(&self) -> usize {
        delegate!(self, b => b.size())
    }

    fn workers(&self) -> usize {
        delegate!(self, b => b.workers())
    }

    fn partition(&self) -> PartitionScheme {
        delegate!(self, b => b.partition())
    }

    fn scatter_work<T: Clone + Send + Sync + 'static>(&self, items: &[T]) -> LocalShare<T> {
        delegate!(self, b => b.scatter_work(items))
    }

    fn execute<T, R, F>(&self, share: LocalShare<T>, f: F) -> std::result::Result<ShareResults<R>, BackendFault>
    where
        T: Send + Sync + 'static,
        R: Send + Sync + 'static,
        F: Fn(&[T]) -> Vec<R> + Send + Sync + 'static,
    {
        delegate!(self, b => b.execute(share, f))
    }

    fn gather<T: Send + 'static>(&self, local: T) -> std::result::Result<Option<Vec<T>>, BackendFault> {
        delegate!(self, b => b.gather(local))
    }

    fn all_gather<T: Clone + Send + 'static>(&self, local: T) -> std::result::Result<Vec<T>, BackendFault> {
        delegate!(self, b => b.all_gather(local))
    }

    fn broadcast<T: Clone + Send + 'static>(
        &self,
        value: Option<T>,
        root: usize,
    ) -> std::result::Result<T, BackendFault> {
        delegate!(self, b => b.broadcast(value, root))
    }

    fn all_reduce<T: Reducible>(&self, value: T, op: ReduceOp) -> std::result::Result<T, BackendFault> {
        delegate!(self, b => b.all_reduce(value, op))
    }

    fn barrier(&self) -> std::result::Result<(), BackendFault> {
        delegate!(self, b => b.barrier())
    }

    fn gather_share<R: Send + 'static>(
        &self,
        results: ShareResults<R>,
    ) -> std::result::Result<Option<Vec<R>>, BackendFault> {
        delegate!(self, b => b.gather_share(results))
    }
}
