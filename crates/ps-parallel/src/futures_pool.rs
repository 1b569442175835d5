//! Worker pool backed by blocking tasks on a private tokio runtime.

use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use ps_types::{panic_message, BackendFault, BackendKind, ConfigError, PartitionScheme, SweepError};

use crate::backend::ParallelBackend;
use crate::partition::{BlockOutput, LocalShare, ShareResults};

/// Blocks are submitted as futures; at most `workers` run at once.
///
/// `execute` drives the private runtime with `block_on`, so it must not be
/// called from inside another tokio runtime.
pub struct FuturesPoolBackend {
    runtime: Runtime,
    workers: usize,
    partition: PartitionScheme,
    max_retries: usize,
}

impl FuturesPoolBackend {
    pub fn new(workers: usize) -> Result<Self, SweepError> {
        if workers == 0 {
            return Err(ConfigError::InvalidBackend {
                message: "futures pool requires at least one worker".to_string(),
            }
            .into());
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers)
            .thread_name("parasweep-futures")
            .enable_all()
            .build()
            .map_err(|e| BackendFault::Runtime(e.to_string()))?;
        Ok(Self {
            runtime,
            workers,
            partition: PartitionScheme::default(),
            max_retries: 0,
        })
    }

    pub fn with_partition(mut self, partition: PartitionScheme) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl std::fmt::Debug for FuturesPoolBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuturesPoolBackend")
            .field("workers", &self.workers)
            .field("partition", &self.partition)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

async fn run_block<T, R, F>(
    index: usize,
    items: Arc<[T]>,
    f: Arc<F>,
    permits: Arc<Semaphore>,
    max_retries: usize,
) -> Result<BlockOutput<R>, BackendFault>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(&[T]) -> Vec<R> + Send + Sync + 'static,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        let permit = Arc::clone(&permits)
            .acquire_owned()
            .await
            .map_err(|e| BackendFault::Runtime(e.to_string()))?;

        let (f, items) = (Arc::clone(&f), Arc::clone(&items));
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f(items.as_ref())
        })
        .await;

        match joined {
            Ok(results) => return Ok(BlockOutput { index, results }),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic().as_ref());
                if attempts <= max_retries {
                    warn!(block = index, attempts, %message, "future crashed, resubmitting");
                    continue;
                }
                error!(block = index, attempts, %message, "future crashed");
                return Err(BackendFault::WorkerCrashed {
                    block: index,
                    attempts,
                    message,
                });
            }
            Err(e) => return Err(BackendFault::Runtime(e.to_string())),
        }
    }
}

impl ParallelBackend for FuturesPoolBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::FuturesPool
    }

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn workers(&self) -> usize {
        self.workers
    }

    fn partition(&self) -> PartitionScheme {
        self.partition
    }

    fn execute<T, R, F>(&self, share: LocalShare<T>, f: F) -> Result<ShareResults<R>, BackendFault>
    where
        T: Send + Sync + 'static,
        R: Send + Sync + 'static,
        F: Fn(&[T]) -> Vec<R> + Send + Sync + 'static,
    {
        let (plan, blocks) = share.into_parts();
        debug!(blocks = blocks.len(), workers = self.workers, "submitting futures");

        let f = Arc::new(f);
        let permits = Arc::new(Semaphore::new(self.workers));
        let max_retries = self.max_retries;

        let outputs = self.runtime.block_on(async move {
            let handles: Vec<_> = blocks
                .into_iter()
                .map(|block| {
                    tokio::spawn(run_block(
                        block.index,
                        Arc::from(block.items),
                        Arc::clone(&f),
                        Arc::clone(&permits),
                        max_retries,
                    ))
                })
                .collect();

            let mut outputs = Vec::with_capacity(handles.len());
            for handle in handles {
                let output = handle
                    .await
                    .map_err(|e| BackendFault::Runtime(e.to_string()))??;
                outputs.push(output);
            }
            Ok::<_, BackendFault>(outputs)
        })?;

        Ok(ShareResults::new(plan, outputs))
    }
}
