//! Fixed-size worker pool on a dedicated rayon thread pool.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use ps_types::{BackendFault, BackendKind, ConfigError, PartitionScheme, SweepError};

use crate::backend::{run_with_retry, ParallelBackend};
use crate::partition::{BlockOutput, LocalShare, ShareResults};

pub struct ProcessPoolBackend {
    pool: ThreadPool,
    workers: usize,
    partition: PartitionScheme,
    max_retries: usize,
}

impl ProcessPoolBackend {
    pub fn new(workers: usize) -> Result<Self, SweepError> {
        if workers == 0 {
            return Err(ConfigError::InvalidBackend {
                message: "process pool requires at least one worker".to_string(),
            }
            .into());
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("parasweep-pool-{i}"))
            .build()
            .map_err(|e| BackendFault::Runtime(e.to_string()))?;
        Ok(Self {
            pool,
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

impl std::fmt::Debug for ProcessPoolBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPoolBackend")
            .field("workers", &self.workers)
            .field("partition", &self.partition)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl ParallelBackend for ProcessPoolBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ProcessPool
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
        debug!(blocks = blocks.len(), workers = self.workers, "dispatching to process pool");

        let max_retries = self.max_retries;
        let outputs = self.pool.install(|| {
            blocks
                .into_par_iter()
                .map(|block| {
                    run_with_retry(block.index, &block.items, &f, max_retries).map(|results| BlockOutput {
                        index: block.index,
                        results,
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        })?;
        Ok(ShareResults::new(plan, outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn order_is_plan_order_for_any_worker_count() {
        let items: Vec<i64> = (0..23).collect();
        for workers in 1..6 {
            for scheme in [PartitionScheme::Contiguous, PartitionScheme::RoundRobin] {
                let backend = ProcessPoolBackend::new(workers).unwrap().with_partition(scheme);
                let share = backend.scatter_work(&items);
                assert_eq!(share.blocks.len(), workers);
                let results = backend
                    .execute(share, |xs: &[i64]| xs.iter().map(|x| x - 100).collect::<Vec<_>>())
                    .unwrap();
                let flat = backend.gather_share(results).unwrap().unwrap();
                assert_eq!(flat, items.iter().map(|x| x - 100).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn blocks_run_on_pool_threads() {
        let backend = ProcessPoolBackend::new(3).unwrap();
        let names = Arc::new(Mutex::new(HashSet::new()));
        let seen = Arc::clone(&names);
        let share = backend.scatter_work(&(0..30).collect::<Vec<u32>>());
        backend
            .execute(share, move |xs: &[u32]| {
                let name = std::thread::current().name().map(str::to_string);
                seen.lock().unwrap().insert(name);
                xs.to_vec()
            })
            .unwrap();
        let names = names.lock().unwrap();
        assert!(names
            .iter()
            .all(|n| n.as_deref().is_some_and(|n| n.starts_with("parasweep-pool-"))));
    }

    #[test]
    fn crashed_block_is_resubmitted() {
        let backend = ProcessPoolBackend::new(2).unwrap().with_max_retries(1);
        let crashes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&crashes);
        let share = backend.scatter_work(&[1u32, 2, 3, 4]);
        let results = backend
            .execute(share, move |xs: &[u32]| {
                if xs.contains(&3) && counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("lost worker");
                }
                xs.to_vec()
            })
            .unwrap();
        assert_eq!(backend.gather_share(results).unwrap().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(crashes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn zero_workers_is_config_error() {
        assert!(ProcessPoolBackend::new(0).unwrap_err().is_config());
    }
}
