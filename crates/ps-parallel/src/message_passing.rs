//! SPMD message passing: a fixed group of ranks, each running the same
//! program, exchanging values over point-to-point channels.

use std::any::Any;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error};

use ps_types::{panic_message, BackendFault, BackendKind, ConfigError, PartitionScheme, SweepError};

use crate::backend::{run_with_retry, ParallelBackend, ReduceOp, Reducible};
use crate::partition::{BlockOutput, LocalShare, PartitionPlan, ShareResults, WorkBlock};

const COORDINATOR: usize = 0;

struct Envelope {
    operation: &'static str,
    payload: Box<dyn Any + Send>,
}

/// One rank's view of the message-passing group.
///
/// Created by [`MessagePassingWorld::launch`]. Every rank must call the same
/// collectives in the same order. Channels close when a rank exits, so a
/// rank that dies mid-sweep turns into a [`BackendFault`] on its peers instead
/// of a hang.
pub struct MessagePassingBackend {
    rank: usize,
    size: usize,
    partition: PartitionScheme,
    /// `outbox[dest]` sends to rank `dest`.
    outbox: Vec<Sender<Envelope>>,
    /// `inbox[src]` receives from rank `src`.
    inbox: Vec<Receiver<Envelope>>,
}

impl std::fmt::Debug for MessagePassingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePassingBackend")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("partition", &self.partition)
            .finish_non_exhaustive()
    }
}

impl MessagePassingBackend {
    fn send<T: Send + 'static>(&self, dest: usize, operation: &'static str, value: T) -> Result<(), BackendFault> {
        self.outbox[dest]
            .send(Envelope {
                operation,
                payload: Box::new(value),
            })
            .map_err(|_| BackendFault::Disconnected {
                rank: dest,
                operation: operation.to_string(),
            })
    }

    fn recv<T: 'static>(&self, src: usize, operation: &'static str) -> Result<T, BackendFault> {
        let envelope = self.inbox[src].recv().map_err(|_| BackendFault::Disconnected {
            rank: src,
            operation: operation.to_string(),
        })?;
        let mismatch = || BackendFault::PayloadMismatch {
            rank: src,
            operation: operation.to_string(),
        };
        if envelope.operation != operation {
            return Err(mismatch());
        }
        envelope.payload.downcast::<T>().map(|b| *b).map_err(|_| mismatch())
    }

    fn gather_to<T: Send + 'static>(
        &self,
        local: T,
        root: usize,
        operation: &'static str,
    ) -> Result<Option<Vec<T>>, BackendFault> {
        if self.rank != root {
            self.send(root, operation, local)?;
            return Ok(None);
        }
        let mut local = Some(local);
        let mut values = Vec::with_capacity(self.size);
        for src in 0..self.size {
            if src == root {
                values.extend(local.take());
            } else {
                values.push(self.recv(src, operation)?);
            }
        }
        Ok(Some(values))
    }

    fn broadcast_from<T: Clone + Send + 'static>(
        &self,
        value: Option<T>,
        root: usize,
        operation: &'static str,
    ) -> Result<T, BackendFault> {
        if self.rank != root {
            return self.recv(root, operation);
        }
        let value = value.ok_or_else(|| BackendFault::PayloadMismatch {
            rank: root,
            operation: operation.to_string(),
        })?;
        for dest in (0..self.size).filter(|&d| d != root) {
            self.send(dest, operation, value.clone())?;
        }
        Ok(value)
    }
}

impl ParallelBackend for MessagePassingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::MessagePassing
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn workers(&self) -> usize {
        self.size
    }

    fn partition(&self) -> PartitionScheme {
        self.partition
    }

    fn scatter_work<T: Clone + Send + Sync + 'static>(&self, items: &[T]) -> LocalShare<T> {
        let plan = PartitionPlan::new(items.len(), self.size, self.partition);
        let block = WorkBlock {
            index: self.rank,
            items: plan.take(items, self.rank),
        };
        debug!(rank = self.rank, items = block.items.len(), "scattered local block");
        LocalShare::new(Arc::new(plan), vec![block])
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
                run_with_retry(block.index, &block.items, &f, 0).map(|results| BlockOutput {
                    index: block.index,
                    results,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ShareResults::new(plan, outputs))
    }

    fn gather<T: Send + 'static>(&self, local: T) -> Result<Option<Vec<T>>, BackendFault> {
        self.gather_to(local, COORDINATOR, "gather")
    }

    fn all_gather<T: Clone + Send + 'static>(&self, local: T) -> Result<Vec<T>, BackendFault> {
        let gathered = self.gather_to(local, COORDINATOR, "all_gather")?;
        self.broadcast_from(gathered, COORDINATOR, "all_gather")
    }

    fn broadcast<T: Clone + Send + 'static>(&self, value: Option<T>, root: usize) -> Result<T, BackendFault> {
        if root >= self.size {
            return Err(BackendFault::Runtime(format!(
                "broadcast root {root} outside group of {}",
                self.size
            )));
        }
        self.broadcast_from(value, root, "broadcast")
    }

    fn all_reduce<T: Reducible>(&self, value: T, op: ReduceOp) -> Result<T, BackendFault> {
        let reduced = self
            .gather_to(value, COORDINATOR, "all_reduce")?
            .and_then(|values| op.fold(values));
        self.broadcast_from(reduced, COORDINATOR, "all_reduce")
    }

    fn barrier(&self) -> Result<(), BackendFault> {
        let arrived = self.gather_to((), COORDINATOR, "barrier")?.map(|_| ());
        self.broadcast_from(arrived, COORDINATOR, "barrier")
    }

    fn gather_share<R: Send + 'static>(&self, results: ShareResults<R>) -> Result<Option<Vec<R>>, BackendFault> {
        let (plan, blocks) = results.into_parts();
        match self.gather_to(blocks, COORDINATOR, "gather_share")? {
            Some(per_rank) => plan.reassemble(per_rank.into_iter().flatten().collect()).map(Some),
            None => Ok(None),
        }
    }
}

/// Launcher for a group of message-passing ranks.
#[derive(Debug, Clone, Copy)]
pub struct MessagePassingWorld {
    size: usize,
    partition: PartitionScheme,
}

impl MessagePassingWorld {
    pub fn new(size: usize) -> Result<Self, SweepError> {
        if size == 0 {
            return Err(ConfigError::InvalidBackend {
                message: "message passing requires at least one rank".to_string(),
            }
            .into());
        }
        Ok(Self {
            size,
            partition: PartitionScheme::default(),
        })
    }

    pub fn with_partition(mut self, partition: PartitionScheme) -> Self {
        self.partition = partition;
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Build one connected backend per rank.
    pub fn connect(&self) -> Vec<MessagePassingBackend> {
        let n = self.size;
        // channels[src][dest]
        let mut senders: Vec<Vec<Option<Sender<Envelope>>>> = (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
        let mut receivers: Vec<Vec<Option<Receiver<Envelope>>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
        for src in 0..n {
            for dest in 0..n {
                let (tx, rx) = unbounded();
                senders[src][dest] = Some(tx);
                receivers[dest][src] = Some(rx);
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (outbox, inbox))| MessagePassingBackend {
                rank,
                size: n,
                partition: self.partition,
                outbox: outbox.into_iter().flatten().collect(),
                inbox: inbox.into_iter().flatten().collect(),
            })
            .collect()
    }

    /// Run `program` on every rank concurrently and return the per-rank
    /// outputs in rank order.
    ///
    /// A rank that panics is reported as [`BackendFault::RankPanicked`];
    /// its peers observe closed channels and unwind through their own
    /// error paths.
    pub fn launch<P, O>(&self, program: P) -> Result<Vec<O>, BackendFault>
    where
        P: Fn(MessagePassingBackend) -> O + Sync,
        O: Send,
    {
        let program = &program;
        thread::scope(|scope| {
            let handles = self
                .connect()
                .into_iter()
                .map(|backend| {
                    let rank = backend.rank;
                    thread::Builder::new()
                        .name(format!("parasweep-rank-{rank}"))
                        .spawn_scoped(scope, move || program(backend))
                        .map_err(|e| BackendFault::Runtime(e.to_string()))
                })
                .collect::<Vec<_>>();

            let mut outputs = Vec::with_capacity(handles.len());
            let mut fault = None;
            for (rank, handle) in handles.into_iter().enumerate() {
                match handle.map(|h| h.join()) {
                    Ok(Ok(output)) => outputs.push(output),
                    Ok(Err(payload)) => {
                        let message = panic_message(payload.as_ref());
                        error!(rank, %message, "rank panicked");
                        fault.get_or_insert(BackendFault::RankPanicked { rank, message });
                    }
                    Err(e) => {
                        fault.get_or_insert(e);
                    }
                }
            }
            match fault {
                Some(fault) => Err(fault),
                None => Ok(outputs),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collectives_across_ranks() {
        let world = MessagePassingWorld::new(4).unwrap();
        let outputs = world
            .launch(|backend| {
                let rank = backend.rank();
                let gathered = backend.gather(rank * 10).unwrap();
                let everyone = backend.all_gather(rank).unwrap();
                let token = backend
                    .broadcast(backend.is_coordinator().then(|| "go".to_string()), 0)
                    .unwrap();
                let from_two = backend.broadcast((rank == 2).then_some(22u32), 2).unwrap();
                let total = backend.all_reduce(rank + 1, ReduceOp::Sum).unwrap();
                let low = backend.all_reduce(rank as f64 - 1.5, ReduceOp::Min).unwrap();
                backend.barrier().unwrap();
                (gathered, everyone, token, from_two, total, low)
            })
            .unwrap();

        assert_eq!(outputs.len(), 4);
        for (rank, (gathered, everyone, token, from_two, total, low)) in outputs.into_iter().enumerate() {
            if rank == 0 {
                assert_eq!(gathered, Some(vec![0, 10, 20, 30]));
            } else {
                assert_eq!(gathered, None);
            }
            assert_eq!(everyone, vec![0, 1, 2, 3]);
            assert_eq!(token, "go");
            assert_eq!(from_two, 22);
            assert_eq!(total, 10);
            assert_eq!(low, -1.5);
        }
    }

    #[test]
    fn scatter_execute_gather_restores_order() {
        let items: Vec<u64> = (0..13).collect();
        for size in 1..7 {
            for scheme in [PartitionScheme::Contiguous, PartitionScheme::RoundRobin] {
                let world = MessagePassingWorld::new(size).unwrap().with_partition(scheme);
                let outputs = world
                    .launch(|backend| {
                        let share = backend.scatter_work(&items);
                        assert_eq!(share.blocks.len(), 1);
                        let results = backend
                            .execute(share, |xs: &[u64]| xs.iter().map(|x| x * 2).collect::<Vec<_>>())
                            .unwrap();
                        backend.gather_share(results).unwrap()
                    })
                    .unwrap();
                let expected: Vec<u64> = items.iter().map(|x| x * 2).collect();
                assert_eq!(outputs[0].as_ref(), Some(&expected));
                assert!(outputs[1..].iter().all(Option::is_none));
            }
        }
    }

    #[test]
    fn more_ranks_than_items() {
        let world = MessagePassingWorld::new(5).unwrap();
        let outputs = world
            .launch(|backend| {
                let share = backend.scatter_work(&[7u8, 8]);
                let local = share.item_count();
                let results = backend.execute(share, |xs: &[u8]| xs.to_vec()).unwrap();
                let total = backend.all_reduce(local, ReduceOp::Sum).unwrap();
                (total, backend.gather_share(results).unwrap())
            })
            .unwrap();
        assert_eq!(outputs[0], (2, Some(vec![7, 8])));
        assert!(outputs[1..].iter().all(|(total, flat)| *total == 2 && flat.is_none()));
    }

    #[test]
    fn lost_rank_is_a_fault_not_a_hang() {
        let world = MessagePassingWorld::new(3).unwrap();
        let result = world.launch(|backend| {
            if backend.rank() == 1 {
                panic!("rank 1 lost");
            }
            backend.all_reduce(1usize, ReduceOp::Sum)
        });
        assert_eq!(
            result.unwrap_err(),
            BackendFault::RankPanicked {
                rank: 1,
                message: "rank 1 lost".to_string(),
            }
        );
    }

    #[test]
    fn surviving_ranks_see_disconnect() {
        let world = MessagePassingWorld::new(2).unwrap();
        let outputs = world
            .launch(|backend| {
                if backend.rank() == 1 {
                    return Ok(0);
                }
                backend.all_reduce(1usize, ReduceOp::Sum)
            })
            .unwrap();
        assert!(matches!(outputs[0], Err(BackendFault::Disconnected { rank: 1, .. })));
    }

    #[test]
    fn zero_ranks_rejected() {
        assert!(MessagePassingWorld::new(0).unwrap_err().is_config());
    }
}
