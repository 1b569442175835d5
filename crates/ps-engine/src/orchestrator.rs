//! Sweep strategies driven over a [`ParallelBackend`].
//!
//! Every rank runs the same program. Only the coordinating rank (rank 0)
//! advances the random stream; the runs it plans are broadcast, scattered
//! with the backend's partition plan, executed, and gathered back into run
//! order on the coordinator, which alone assembles the result tables.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use ps_parallel::{Backend, MessagePassingWorld, ParallelBackend, ReduceOp};
use ps_sampler::{differential_spec, SampleStream, Sampler};
use ps_store::SweepStore;
use ps_types::{
    BackendFault, ConfigError, DifferentialSpec, DifferentialSweepResult, OutputDef, Result, RunRecord,
    SampleSpec, StoreError, StrategyConfig, StrategyKind, SweepConfig, SweepError, SweepMetadata, SweepResult,
    SweepWarning,
};

use crate::executor::RunExecutor;
use crate::experiment::Experiment;

const COORDINATOR: usize = 0;

/// Lifecycle of one sweep call, traced at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    Planning,
    Dispatching,
    Collecting,
    Done,
    Failed,
}

impl fmt::Display for SweepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Dispatching => "dispatching",
            Self::Collecting => "collecting",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a completed sweep produced on the coordinating rank.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepOutcome {
    Single(SweepResult),
    Differential(DifferentialSweepResult),
}

impl SweepOutcome {
    pub fn single(&self) -> Option<&SweepResult> {
        match self {
            Self::Single(result) => Some(result),
            Self::Differential(_) => None,
        }
    }

    pub fn into_single(self) -> Option<SweepResult> {
        match self {
            Self::Single(result) => Some(result),
            Self::Differential(_) => None,
        }
    }

    pub fn into_differential(self) -> Option<DifferentialSweepResult> {
        match self {
            Self::Differential(result) => Some(result),
            Self::Single(_) => None,
        }
    }

    /// The table holding the requested samples: the result itself, or the
    /// nominal table of a differential sweep.
    pub fn primary(&self) -> &SweepResult {
        match self {
            Self::Single(result) => result,
            Self::Differential(result) => &result.nominal,
        }
    }

    pub fn persist(&self, store: &SweepStore, group: &str) -> std::result::Result<PathBuf, StoreError> {
        match self {
            Self::Single(result) => store.persist(result, group),
            Self::Differential(result) => store.persist_differential(result, group),
        }
    }
}

/// One run as planned by the coordinator, with its place in the result
/// table.
#[derive(Debug, Clone)]
struct PlannedRun {
    index: usize,
    pass: usize,
    nominal_index: Option<usize>,
    perturbed: Option<String>,
    inputs: Vec<f64>,
}

impl PlannedRun {
    fn new(index: usize, pass: usize, inputs: Vec<f64>) -> Self {
        Self {
            index,
            pass,
            nominal_index: None,
            perturbed: None,
            inputs,
        }
    }

    fn tag(&self, record: &mut RunRecord) {
        record.index = self.index;
        record.pass = self.pass;
        record.nominal_index = self.nominal_index;
        record.perturbed = self.perturbed.clone();
    }
}

/// Output of one scatter/execute/gather round.
struct Dispatched {
    local_successes: usize,
    /// Every record in run order; `Some` on the coordinator only.
    records: Option<Vec<RunRecord>>,
}

/// Runs of one table plus the counts needed for its metadata.
struct Collected {
    records: Option<Vec<RunRecord>>,
    achieved: usize,
    passes: usize,
}

/// Per-rank CSV of every record this rank executed.
struct DebugDump {
    path: PathBuf,
    keys: Vec<String>,
    outputs: Vec<OutputDef>,
    records: Vec<RunRecord>,
}

impl DebugDump {
    fn new(dir: &Path, rank: usize, keys: Vec<String>, outputs: Vec<OutputDef>) -> std::result::Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(format!("local_results_{rank:03}.csv")),
            keys,
            outputs,
            records: Vec::new(),
        })
    }

    fn append<'r>(&mut self, records: impl Iterator<Item = &'r RunRecord>) -> std::result::Result<(), StoreError> {
        self.records.extend(records.cloned());
        ps_store::write_records(&self.keys, &self.outputs, &self.records, &self.path)
    }
}

/// Validated sweep definition, runnable on any backend.
pub struct SweepOrchestrator<M> {
    experiment: Arc<Experiment<M>>,
    executor: Arc<RunExecutor<M>>,
    specs: Vec<SampleSpec>,
    config: SweepConfig,
}

impl<M> fmt::Debug for SweepOrchestrator<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SweepOrchestrator")
            .field("experiment", &self.experiment)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<M: 'static> SweepOrchestrator<M> {
    /// Validate `config` against `experiment`; no run executes on error.
    pub fn new(experiment: Experiment<M>, config: SweepConfig) -> Result<Self> {
        config.validate()?;
        experiment.validate(config.count)?;
        let specs = experiment.specs();

        let recursive = matches!(
            config.strategy,
            StrategyConfig::Recursive { .. }
                | StrategyConfig::Differential {
                    recursive_passes: Some(_),
                    ..
                }
        );
        if recursive {
            if let Some(fixed) = specs.iter().find(|s| s.kind.is_fixed()) {
                return Err(ConfigError::InvalidStrategy {
                    message: format!(
                        "recursive sweeps resample failures and need probability specs; {} is {}",
                        fixed.key,
                        fixed.kind.name()
                    ),
                }
                .into());
            }
        }
        if let StrategyConfig::Differential { specs: diffs, .. } = &config.strategy {
            for diff in diffs {
                let spec = specs
                    .iter()
                    .find(|s| s.key == diff.key)
                    .ok_or_else(|| ConfigError::UnknownParameter { key: diff.key.clone() })?;
                let bound = spec.kind.magnitude_bound();
                let reach = bound + diff.perturbation.half_width(bound);
                if !(2.0 * reach).is_finite() {
                    return Err(ConfigError::InvalidDistribution {
                        key: diff.key.clone(),
                        message: format!("perturbing values up to {bound:e} overflows"),
                    }
                    .into());
                }
            }
        }

        let experiment = Arc::new(experiment);
        let executor = Arc::new(RunExecutor::new(Arc::clone(&experiment), config.executor.clone()));
        Ok(Self {
            experiment,
            executor,
            specs,
            config,
        })
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn experiment(&self) -> &Experiment<M> {
        &self.experiment
    }

    /// Execute the sweep on `backend`.
    ///
    /// Every rank of the backend must call this; the coordinator returns the
    /// outcome and all other ranks return `None`.
    pub fn run<B: ParallelBackend>(&self, backend: &B) -> Result<Option<SweepOutcome>> {
        let mut run = SweepRun::new(self, backend)?;
        match run.execute() {
            Ok(outcome) => {
                run.trace(SweepPhase::Done);
                Ok(outcome)
            }
            Err(e) => {
                run.trace(SweepPhase::Failed);
                error!(sweep = %self.config.name, rank = backend.rank(), "Sweep failed: {}", e);
                Err(e)
            }
        }
    }
}

/// State of one `run` call on one rank.
struct SweepRun<'a, M, B> {
    orchestrator: &'a SweepOrchestrator<M>,
    backend: &'a B,
    sampler: Sampler,
    /// Present on the coordinator only.
    stream: Option<SampleStream>,
    dump: Option<DebugDump>,
    started_at: DateTime<Utc>,
    clock: Instant,
}

impl<'a, M: 'static, B: ParallelBackend> SweepRun<'a, M, B> {
    fn new(orchestrator: &'a SweepOrchestrator<M>, backend: &'a B) -> Result<Self> {
        let config = &orchestrator.config;
        let stream = backend.is_coordinator().then(|| SampleStream::new(config.seed));
        if let Some(stream) = &stream {
            info!(
                sweep = %config.name,
                strategy = %config.strategy.kind(),
                backend = %backend.kind(),
                count = config.count,
                seed = stream.seed(),
                "Starting sweep"
            );
        }
        let dump = match &config.debug_dump_dir {
            Some(dir) => Some(DebugDump::new(
                dir,
                backend.rank(),
                orchestrator.experiment.parameter_keys(),
                orchestrator.experiment.output_defs(),
            )?),
            None => None,
        };
        Ok(Self {
            orchestrator,
            backend,
            sampler: Sampler::new().with_latin_hypercube(config.latin_hypercube),
            stream,
            dump,
            started_at: Utc::now(),
            clock: Instant::now(),
        })
    }

    fn trace(&self, phase: SweepPhase) {
        debug!(
            sweep = %self.orchestrator.config.name,
            rank = self.backend.rank(),
            %phase,
            "sweep phase"
        );
    }

    fn execute(&mut self) -> Result<Option<SweepOutcome>> {
        self.trace(SweepPhase::Planning);
        let orchestrator = self.orchestrator;
        let count = orchestrator.config.count;

        let outcome = match &orchestrator.config.strategy {
            StrategyConfig::Simple => {
                let collected = self.simple(count)?;
                self.table(StrategyKind::Simple, count, collected, Vec::new())
                    .map(SweepOutcome::Single)
            }
            StrategyConfig::Recursive { max_passes } => {
                let collected = self.recursive(count, *max_passes)?;
                let warnings = self.exhaustion(count, &collected);
                self.table(StrategyKind::Recursive, count, collected, warnings)
                    .map(SweepOutcome::Single)
            }
            StrategyConfig::Differential {
                specs,
                recursive_passes,
            } => {
                let nominal = match recursive_passes {
                    Some(max_passes) => self.recursive(count, *max_passes)?,
                    None => self.simple(count)?,
                };
                let warnings = self.exhaustion(count, &nominal);
                let (perturbed, planned) = self.perturb(specs, nominal.records.as_deref())?;

                let nominal = self.table(StrategyKind::Differential, count, nominal, warnings);
                let differential = self.table(StrategyKind::Differential, planned, perturbed, Vec::new());
                match (nominal, differential) {
                    (Some(nominal), Some(mut differential)) => {
                        differential.metadata.id = nominal.metadata.id;
                        Some(SweepOutcome::Differential(DifferentialSweepResult {
                            nominal,
                            differential,
                        }))
                    }
                    _ => None,
                }
            }
        };

        if let Some(outcome) = &outcome {
            let primary = outcome.primary();
            info!(
                "Sweep {} finished: {}/{} successful runs in {} pass(es), {:.3}s",
                primary.metadata.name,
                primary.metadata.achieved,
                primary.metadata.requested,
                primary.metadata.passes,
                primary.metadata.elapsed_seconds
            );
        }
        Ok(outcome)
    }

    /// Coordinator-only: draw `count` tuples from the continued stream.
    fn plan(&mut self, count: usize, base: usize, pass: usize) -> Result<Option<Vec<PlannedRun>>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        let block = self.sampler.generate(&self.orchestrator.specs, count, stream)?;
        Ok(Some(
            block
                .rows
                .into_iter()
                .enumerate()
                .map(|(i, inputs)| PlannedRun::new(base + i, pass, inputs))
                .collect(),
        ))
    }

    /// Broadcast the coordinator's plan, execute this rank's share and gather
    /// everything back in run order.
    fn dispatch(&mut self, planned: Option<Vec<PlannedRun>>) -> Result<Dispatched> {
        self.trace(SweepPhase::Dispatching);
        let runs: Vec<PlannedRun> = self.backend.broadcast(planned, COORDINATOR)?;
        let share = self.backend.scatter_work(&runs);
        debug!(rank = self.backend.rank(), runs = share.item_count(), "executing local share");

        let executor = Arc::clone(&self.orchestrator.executor);
        let results = self.backend.execute(share, move |block: &[PlannedRun]| {
            let mut records = executor.execute_block(block.iter().map(|run| run.inputs.as_slice()));
            for (record, run) in records.iter_mut().zip(block) {
                run.tag(record);
            }
            records
        })?;

        let local_successes = results.local_results().filter(|r| r.is_success()).count();
        if let Some(dump) = &mut self.dump {
            dump.append(results.local_results())?;
        }

        self.trace(SweepPhase::Collecting);
        let records = self.backend.gather_share(results)?;
        Ok(Dispatched {
            local_successes,
            records,
        })
    }

    fn simple(&mut self, count: usize) -> Result<Collected> {
        let planned = self.plan(count, 0, 0)?;
        let dispatched = self.dispatch(planned)?;
        let achieved = self.backend.all_reduce(dispatched.local_successes, ReduceOp::Sum)?;
        Ok(Collected {
            records: dispatched.records,
            achieved,
            passes: 1,
        })
    }

    /// Repeat simple passes over the shortfall until `count` runs succeeded
    /// or `max_passes` passes ran. Failed attempts stay in the table.
    fn recursive(&mut self, count: usize, max_passes: usize) -> Result<Collected> {
        let mut records = self.backend.is_coordinator().then(Vec::new);
        let mut achieved = 0;
        let mut passes = 0;
        while achieved < count && passes < max_passes {
            let shortfall = count - achieved;
            let base = records.as_ref().map_or(0, Vec::len);
            let planned = self.plan(shortfall, base, passes)?;
            let dispatched = self.dispatch(planned)?;
            let successes = self.backend.all_reduce(dispatched.local_successes, ReduceOp::Sum)?;

            if let (Some(all), Some(new)) = (records.as_mut(), dispatched.records) {
                all.extend(new);
            }
            achieved += successes;
            passes += 1;
            if self.backend.is_coordinator() {
                info!(
                    pass = passes,
                    drawn = shortfall,
                    successes,
                    "Recursive pass complete: {}/{} successful runs",
                    achieved,
                    count
                );
            }
        }
        Ok(Collected {
            records,
            achieved,
            passes,
        })
    }

    fn exhaustion(&self, count: usize, collected: &Collected) -> Vec<SweepWarning> {
        if collected.achieved >= count {
            return Vec::new();
        }
        if self.backend.is_coordinator() {
            warn!(
                "Sweep {} exhausted {} passes with {}/{} successful runs",
                self.orchestrator.config.name, collected.passes, collected.achieved, count
            );
        }
        vec![SweepWarning::ResamplingExhausted {
            requested: count,
            achieved: collected.achieved,
            passes: collected.passes,
        }]
    }

    /// One inner sweep per nominal run and differential parameter, batched
    /// into a single dispatch. Returns the collected runs and how many were
    /// planned.
    fn perturb(&mut self, diffs: &[DifferentialSpec], nominal: Option<&[RunRecord]>) -> Result<(Collected, usize)> {
        let planned = match (self.stream.as_mut(), nominal) {
            (Some(stream), Some(nominal)) => {
                let mut planned = Vec::new();
                for record in nominal {
                    for diff in diffs {
                        let col = self
                            .orchestrator
                            .specs
                            .iter()
                            .position(|s| s.key == diff.key)
                            .ok_or_else(|| ConfigError::UnknownParameter { key: diff.key.clone() })?;
                        let spec = differential_spec(record.inputs[col], diff);
                        let block = self.sampler.generate(std::slice::from_ref(&spec), diff.count, stream)?;
                        for row in block.rows {
                            let mut inputs = record.inputs.clone();
                            inputs[col] = row[0];
                            planned.push(PlannedRun {
                                nominal_index: Some(record.index),
                                perturbed: Some(diff.key.clone()),
                                ..PlannedRun::new(planned.len(), 0, inputs)
                            });
                        }
                    }
                }
                debug!(runs = planned.len(), "planned differential runs");
                Some(planned)
            }
            _ => None,
        };
        let planned_count = planned.as_ref().map_or(0, Vec::len);

        let dispatched = self.dispatch(planned)?;
        let achieved = self.backend.all_reduce(dispatched.local_successes, ReduceOp::Sum)?;
        Ok((
            Collected {
                records: dispatched.records,
                achieved,
                passes: 1,
            },
            planned_count,
        ))
    }

    /// Coordinator-only: assemble a result table.
    fn table(
        &self,
        strategy: StrategyKind,
        requested: usize,
        collected: Collected,
        warnings: Vec<SweepWarning>,
    ) -> Option<SweepResult> {
        let records = collected.records?;
        let config = &self.orchestrator.config;
        let experiment = &self.orchestrator.experiment;

        let mut metadata = SweepMetadata::new(config.name.clone(), strategy, self.backend.kind());
        metadata.requested = requested;
        metadata.achieved = collected.achieved;
        metadata.passes = collected.passes;
        metadata.started_at = self.started_at;
        metadata.elapsed_seconds = self.clock.elapsed().as_secs_f64();

        let mut result = SweepResult::new(metadata, experiment.parameter_keys(), experiment.output_defs());
        result.records = records;
        result.warnings = warnings;
        Some(result)
    }
}

/// Run a sweep on the pooled backend named by `config.backend`.
pub fn run_sweep<M: 'static>(experiment: Experiment<M>, config: SweepConfig) -> Result<SweepOutcome> {
    let backend = Backend::from_config(&config.backend, config.partition)?;
    let orchestrator = SweepOrchestrator::new(experiment, config)?;
    orchestrator.run(&backend)?.ok_or_else(no_outcome)
}

/// Run a sweep as an SPMD program on `ranks` message-passing ranks.
pub fn run_message_passing<M: 'static>(
    experiment: Experiment<M>,
    config: SweepConfig,
    ranks: usize,
) -> Result<SweepOutcome> {
    let world = MessagePassingWorld::new(ranks)?.with_partition(config.partition);
    let orchestrator = SweepOrchestrator::new(experiment, config)?;
    let per_rank = world.launch(|backend| orchestrator.run(&backend))?;

    let mut outcome = None;
    for result in per_rank {
        if let Some(o) = result? {
            outcome = Some(o);
        }
    }
    outcome.ok_or_else(no_outcome)
}

fn no_outcome() -> SweepError {
    BackendFault::Runtime("coordinator returned no result".to_string()).into()
}
