use ps_types::{BackendFault, BackendKind, PartitionScheme};

use crate::backend::{run_with_retry, ParallelBackend};
use crate::partition::{BlockOutput, LocalShare, ShareResults};

/// Everything on the calling thread, one block.
#[derive(Debug, Clone, Default)]
pub struct SerialBackend {
    partition: PartitionScheme,
    max_retries: usize,
}

impl SerialBackend {
    pub fn new() -> Self {
        Self::default()
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

impl ParallelBackend for SerialBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Serial
    }

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn workers(&self) -> usize {
        1
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
        let outputs = blocks
            .into_iter()
            .map(|block| {
                run_with_retry(block.index, &block.items, &f, self.max_retries).map(|results| BlockOutput {
                    index: block.index,
                    results,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ShareResults::new(plan, outputs))
    }
}
