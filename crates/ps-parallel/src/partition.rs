//! Deterministic work partitioning and order reconstruction.

use std::sync::Arc;

use ps_types::{BackendFault, PartitionScheme};

/// Assignment of global item indices to work blocks.
///
/// Computed purely from the item count, the block count and the scheme, so
/// every rank derives the same plan without communicating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    total: usize,
    scheme: PartitionScheme,
    blocks: Vec<Vec<usize>>,
}

impl PartitionPlan {
    pub fn new(total: usize, parts: usize, scheme: PartitionScheme) -> Self {
        let parts = parts.max(1);
        let blocks = match scheme {
            PartitionScheme::Contiguous => {
                let base = total / parts;
                let extra = total % parts;
                let mut start = 0;
                (0..parts)
                    .map(|b| {
                        let len = base + usize::from(b < extra);
                        let block: Vec<usize> = (start..start + len).collect();
                        start += len;
                        block
                    })
                    .collect()
            }
            PartitionScheme::RoundRobin => (0..parts)
                .map(|b| (b..total).step_by(parts).collect())
                .collect(),
        };
        Self {
            total,
            scheme,
            blocks,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn scheme(&self) -> PartitionScheme {
        self.scheme
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Global item indices held by `block`.
    pub fn block(&self, block: usize) -> &[usize] {
        self.blocks.get(block).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Copy the items of `block` out of the full item list.
    pub fn take<T: Clone>(&self, items: &[T], block: usize) -> Vec<T> {
        self.block(block).iter().map(|&i| items[i].clone()).collect()
    }

    /// Put per-block results back into global item order.
    ///
    /// Fails if a block is missing, reported twice, or carries a result count
    /// different from its planned item count.
    pub fn reassemble<R>(&self, outputs: Vec<BlockOutput<R>>) -> Result<Vec<R>, BackendFault> {
        let mismatch = |block: usize| BackendFault::PayloadMismatch {
            rank: block,
            operation: "gather_share".to_string(),
        };

        let mut slots: Vec<Option<R>> = (0..self.total).map(|_| None).collect();
        for output in outputs {
            let indices = self.blocks.get(output.index).ok_or_else(|| mismatch(output.index))?;
            if indices.len() != output.results.len() {
                return Err(mismatch(output.index));
            }
            for (&i, result) in indices.iter().zip(output.results) {
                if slots[i].replace(result).is_some() {
                    return Err(mismatch(output.index));
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.ok_or_else(|| {
                    let block = self.blocks.iter().position(|b| b.contains(&i)).unwrap_or(0);
                    mismatch(block)
                })
            })
            .collect()
    }
}

/// Items assigned to one worker or rank.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkBlock<T> {
    pub index: usize,
    pub items: Vec<T>,
}

/// The blocks a backend instance is responsible for executing.
///
/// Message-passing ranks hold only their own block; pooled backends hold one
/// block per worker.
#[derive(Debug, Clone)]
pub struct LocalShare<T> {
    plan: Arc<PartitionPlan>,
    pub blocks: Vec<WorkBlock<T>>,
}

impl<T> LocalShare<T> {
    pub fn new(plan: Arc<PartitionPlan>, blocks: Vec<WorkBlock<T>>) -> Self {
        Self { plan, blocks }
    }

    /// Share holding every block of `plan`.
    pub fn all_blocks(items: &[T], plan: PartitionPlan) -> Self
    where
        T: Clone,
    {
        let blocks = (0..plan.num_blocks())
            .map(|b| WorkBlock {
                index: b,
                items: plan.take(items, b),
            })
            .collect();
        Self::new(Arc::new(plan), blocks)
    }

    pub fn plan(&self) -> &Arc<PartitionPlan> {
        &self.plan
    }

    pub fn item_count(&self) -> usize {
        self.blocks.iter().map(|b| b.items.len()).sum()
    }

    pub fn into_parts(self) -> (Arc<PartitionPlan>, Vec<WorkBlock<T>>) {
        (self.plan, self.blocks)
    }
}

/// Results of one executed block, aligned to the block's items.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockOutput<R> {
    pub index: usize,
    pub results: Vec<R>,
}

/// Local results of an executed share, before gathering.
#[derive(Debug, Clone)]
pub struct ShareResults<R> {
    plan: Arc<PartitionPlan>,
    pub blocks: Vec<BlockOutput<R>>,
}

impl<R> ShareResults<R> {
    pub fn new(plan: Arc<PartitionPlan>, blocks: Vec<BlockOutput<R>>) -> Self {
        Self { plan, blocks }
    }

    pub fn plan(&self) -> &Arc<PartitionPlan> {
        &self.plan
    }

    /// Local results in block order.
    pub fn local_results(&self) -> impl Iterator<Item = &R> {
        self.blocks.iter().flat_map(|b| b.results.iter())
    }

    pub fn into_parts(self) -> (Arc<PartitionPlan>, Vec<BlockOutput<R>>) {
        (self.plan, self.blocks)
    }
}
