//! Task-graph runtime: blocks become task descriptors pulled from a shared
//! queue by a fixed set of worker threads.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::unbounded;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use ps_types::{
    panic_message, BackendFault, BackendKind, PartitionScheme, SweepError, TaskRuntimeConfig,
};

use crate::backend::ParallelBackend;
use crate::partition::{BlockOutput, LocalShare, ShareResults};

/// Describes one block submitted to the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Stable across resubmissions of the same block.
    pub task_id: Uuid,
    /// Execution this task belongs to.
    pub execution_id: Uuid,
    pub namespace: String,
    /// Block index within the partition plan.
    pub block: usize,
    /// Position of the block in the submitted share.
    pub slot: usize,
    /// 1-based attempt number.
    pub attempt: usize,
    pub item_count: usize,
}

impl TaskDescriptor {
    fn resubmit(mut self) -> Self {
        self.attempt += 1;
        self
    }
}

/// Counters over the lifetime of a runtime backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRuntimeStats {
    pub executions: u64,
    pub submitted: u64,
    pub completed: u64,
    pub resubmitted: u64,
    pub crashed: u64,
}

enum TaskEvent {
    Completed(TaskDescriptor),
    Crashed(TaskDescriptor, String),
}

#[derive(Debug)]
pub struct TaskRuntimeBackend {
    config: TaskRuntimeConfig,
    partition: PartitionScheme,
    stats: RwLock<TaskRuntimeStats>,
}

impl TaskRuntimeBackend {
    pub fn new(config: TaskRuntimeConfig) -> Result<Self, SweepError> {
        ps_types::BackendConfig::TaskRuntime(config.clone()).validate()?;
        Ok(Self {
            config,
            partition: PartitionScheme::default(),
            stats: RwLock::new(TaskRuntimeStats::default()),
        })
    }

    pub fn with_partition(mut self, partition: PartitionScheme) -> Self {
        self.partition = partition;
        self
    }

    pub fn config(&self) -> &TaskRuntimeConfig {
        &self.config
    }

    pub fn stats(&self) -> TaskRuntimeStats {
        self.stats.read().clone()
    }
}

impl ParallelBackend for TaskRuntimeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::TaskRuntime
    }

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn workers(&self) -> usize {
        self.config.max_concurrent_tasks
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
        let execution_id = Uuid::new_v4();
        let tasks: Vec<TaskDescriptor> = blocks
            .iter()
            .enumerate()
            .map(|(slot, block)| TaskDescriptor {
                task_id: Uuid::new_v4(),
                execution_id,
                namespace: self.config.namespace.clone(),
                block: block.index,
                slot,
                attempt: 1,
                item_count: block.items.len(),
            })
            .collect();

        let num_workers = self.config.max_concurrent_tasks.min(tasks.len()).max(1);
        debug!(
            %execution_id,
            namespace = %self.config.namespace,
            tasks = tasks.len(),
            workers = num_workers,
            "submitting tasks"
        );
        {
            let mut stats = self.stats.write();
            stats.executions += 1;
            stats.submitted += tasks.len() as u64;
        }

        let table: DashMap<Uuid, Vec<R>> = DashMap::new();
        let aborted = AtomicBool::new(false);
        let max_retries = self.config.max_retries;

        let fault = thread::scope(|scope| {
            let (task_tx, task_rx) = unbounded::<TaskDescriptor>();
            let (event_tx, event_rx) = unbounded::<TaskEvent>();

            for worker in 0..num_workers {
                let task_rx = task_rx.clone();
                let event_tx = event_tx.clone();
                let (blocks, table, aborted, f) = (&blocks, &table, &aborted, &f);
                thread::Builder::new()
                    .name(format!("parasweep-task-{worker}"))
                    .spawn_scoped(scope, move || {
                        for task in task_rx.iter() {
                            if aborted.load(Ordering::Relaxed) {
                                break;
                            }
                            let items = &blocks[task.slot].items;
                            let event = match catch_unwind(AssertUnwindSafe(|| f(items))) {
                                Ok(results) => {
                                    table.insert(task.task_id, results);
                                    TaskEvent::Completed(task)
                                }
                                Err(payload) => TaskEvent::Crashed(task, panic_message(payload.as_ref())),
                            };
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                    })
                    .map_err(|e| BackendFault::Runtime(e.to_string()))?;
            }
            drop(task_rx);
            drop(event_tx);

            let mut pending = tasks.len();
            for task in tasks.iter().cloned() {
                task_tx
                    .send(task)
                    .map_err(|_| BackendFault::Runtime("task queue closed".to_string()))?;
            }

            let mut fault = None;
            while pending > 0 {
                match event_rx.recv() {
                    Ok(TaskEvent::Completed(_)) => {
                        self.stats.write().completed += 1;
                        pending -= 1;
                    }
                    Ok(TaskEvent::Crashed(task, message)) if task.attempt <= max_retries => {
                        warn!(task_id = %task.task_id, block = task.block, attempt = task.attempt, %message, "task crashed, resubmitting");
                        self.stats.write().resubmitted += 1;
                        if task_tx.send(task.resubmit()).is_err() {
                            fault = Some(BackendFault::Runtime("task queue closed".to_string()));
                            break;
                        }
                    }
                    Ok(TaskEvent::Crashed(task, message)) => {
                        error!(task_id = %task.task_id, block = task.block, attempt = task.attempt, %message, "task crashed");
                        self.stats.write().crashed += 1;
                        fault = Some(BackendFault::WorkerCrashed {
                            block: task.block,
                            attempts: task.attempt,
                            message,
                        });
                        break;
                    }
                    Err(_) => {
                        fault = Some(BackendFault::Runtime("all task workers exited".to_string()));
                        break;
                    }
                }
            }
            if fault.is_some() {
                aborted.store(true, Ordering::Relaxed);
            }
            drop(task_tx);
            Ok::<_, BackendFault>(fault)
        })?;

        if let Some(fault) = fault {
            return Err(fault);
        }

        let outputs = tasks
            .iter()
            .map(|task| {
                table
                    .remove(&task.task_id)
                    .map(|(_, results)| BlockOutput {
                        index: task.block,
                        results,
                    })
                    .ok_or_else(|| BackendFault::Runtime(format!("task {} produced no result", task.task_id)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ShareResults::new(plan, outputs))
    }
}
