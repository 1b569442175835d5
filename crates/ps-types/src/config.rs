//! Explicit configuration structs for every sweep component.
//!
//! Each struct has a `Default`, chained `with_*` builders, and a `validate`
//! method that reports a [`ConfigError`] before any work is dispatched.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::{ConfigError, StoreError};

/// Opaque configuration handed to the model-building callback.
pub type ModelConfig = BTreeMap<String, serde_json::Value>;

/// Opaque options handed to the evaluation callback.
pub type EvalOptions = BTreeMap<String, serde_json::Value>;

/// Which orchestration strategy produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Simple,
    Recursive,
    Differential,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Simple => "simple",
            Self::Recursive => "recursive",
            Self::Differential => "differential",
        };
        f.write_str(s)
    }
}

/// Identity of the parallel substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Serial,
    ProcessPool,
    FuturesPool,
    MessagePassing,
    TaskRuntime,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Serial => "serial",
            Self::ProcessPool => "process_pool",
            Self::FuturesPool => "futures_pool",
            Self::MessagePassing => "message_passing",
            Self::TaskRuntime => "task_runtime",
        };
        f.write_str(s)
    }
}

/// Configuration for the task-graph runtime backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRuntimeConfig {
    /// Namespace tagged onto every task descriptor.
    pub namespace: String,
    /// Maximum number of concurrently running tasks.
    pub max_concurrent_tasks: usize,
    /// How often a crashed task is resubmitted before the sweep faults.
    pub max_retries: usize,
}

impl Default for TaskRuntimeConfig {
    fn default() -> Self {
        Self {
            namespace: "parasweep".to_string(),
            max_concurrent_tasks: 4,
            max_retries: DEFAULT_BLOCK_RETRIES,
        }
    }
}

/// Backend selection. Pure configuration: results never depend on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendConfig {
    Serial,
    /// `max_retries` bounds how often a block whose worker panicked is
    /// resubmitted before the sweep faults.
    ProcessPool {
        workers: usize,
        #[serde(default = "default_block_retries")]
        max_retries: usize,
    },
    FuturesPool {
        workers: usize,
        #[serde(default = "default_block_retries")]
        max_retries: usize,
    },
    /// Rank count is provisioned by whoever launches the ranks.
    MessagePassing,
    TaskRuntime(TaskRuntimeConfig),
}

/// Resubmissions of a crashed block granted by pool backends.
pub const DEFAULT_BLOCK_RETRIES: usize = 1;

fn default_block_retries() -> usize {
    DEFAULT_BLOCK_RETRIES
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Serial
    }
}

impl BackendConfig {
    pub fn process_pool(workers: usize) -> Self {
        Self::ProcessPool {
            workers,
            max_retries: DEFAULT_BLOCK_RETRIES,
        }
    }

    pub fn futures_pool(workers: usize) -> Self {
        Self::FuturesPool {
            workers,
            max_retries: DEFAULT_BLOCK_RETRIES,
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Serial => BackendKind::Serial,
            Self::ProcessPool { .. } => BackendKind::ProcessPool,
            Self::FuturesPool { .. } => BackendKind::FuturesPool,
            Self::MessagePassing => BackendKind::MessagePassing,
            Self::TaskRuntime(_) => BackendKind::TaskRuntime,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero_workers = |what: &str| ConfigError::InvalidBackend {
            message: format!("{what} requires at least one worker"),
        };
        match self {
            Self::ProcessPool { workers: 0, .. } => Err(zero_workers("process pool")),
            Self::FuturesPool { workers: 0, .. } => Err(zero_workers("futures pool")),
            Self::TaskRuntime(cfg) if cfg.max_concurrent_tasks == 0 => {
                Err(zero_workers("task runtime"))
            }
            _ => Ok(()),
        }
    }
}

/// How a flat work list is split across ranks or workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionScheme {
    /// Contiguous blocks; the first `n % p` blocks hold one extra item.
    #[default]
    Contiguous,
    /// Item `i` goes to block `i % p`.
    RoundRobin,
}

/// Order of the per-run model preparation steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOrder {
    /// Apply sampled values, then initialize, then evaluate.
    #[default]
    ApplyThenInitialize,
    /// Initialize first so sampled values overwrite initialization results.
    InitializeThenApply,
}

/// Run executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Build one model per work block and re-initialize it before each run
    /// instead of building a fresh model per run.
    pub reuse_model: bool,
    pub apply_order: ApplyOrder,
    /// When false, outputs of failed runs are still extracted best-effort
    /// instead of being replaced by NaN sentinels.
    pub check_failures: bool,
    /// Invoke the reinitialize callback once and retry a failed evaluation.
    pub recover_failures: bool,
    pub model_config: ModelConfig,
    pub eval_options: EvalOptions,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            reuse_model: false,
            apply_order: ApplyOrder::default(),
            check_failures: true,
            recover_failures: true,
            model_config: ModelConfig::new(),
            eval_options: EvalOptions::new(),
        }
    }
}

/// Size of a differential perturbation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Perturbation {
    /// Fixed offset `delta`.
    Absolute { delta: f64 },
    /// Offset `|nominal| * fraction`.
    Relative { fraction: f64 },
}

impl Perturbation {
    /// Half-width of the perturbation interval around `nominal`.
    pub fn half_width(&self, nominal: f64) -> f64 {
        match self {
            Self::Absolute { delta } => *delta,
            Self::Relative { fraction } => nominal.abs() * fraction,
        }
    }
}

/// Placement of differential samples inside `[nominal - d, nominal + d]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerturbationPlacement {
    #[default]
    Linear,
    Uniform,
}

/// One designated differential parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferentialSpec {
    pub key: String,
    pub perturbation: Perturbation,
    #[serde(default)]
    pub placement: PerturbationPlacement,
    /// Perturbed samples per nominal sample.
    pub count: usize,
}

impl DifferentialSpec {
    pub fn absolute(key: impl Into<String>, delta: f64, count: usize) -> Self {
        Self {
            key: key.into(),
            perturbation: Perturbation::Absolute { delta },
            placement: PerturbationPlacement::Linear,
            count,
        }
    }

    pub fn relative(key: impl Into<String>, fraction: f64, count: usize) -> Self {
        Self {
            key: key.into(),
            perturbation: Perturbation::Relative { fraction },
            placement: PerturbationPlacement::Linear,
            count,
        }
    }

    pub fn with_placement(mut self, placement: PerturbationPlacement) -> Self {
        self.placement = placement;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let size = match self.perturbation {
            Perturbation::Absolute { delta } => delta,
            Perturbation::Relative { fraction } => fraction,
        };
        if !size.is_finite() || size <= 0.0 {
            return Err(ConfigError::InvalidStrategy {
                message: format!("perturbation of {} must be finite and positive", self.key),
            });
        }
        if self.count == 0 {
            return Err(ConfigError::InvalidStrategy {
                message: format!("differential parameter {} needs at least one sample", self.key),
            });
        }
        Ok(())
    }
}

/// Strategy selection and its per-strategy knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategyConfig {
    Simple,
    Recursive {
        max_passes: usize,
    },
    Differential {
        specs: Vec<DifferentialSpec>,
        /// Run the nominal sweep recursively with this pass bound.
        recursive_passes: Option<usize>,
    },
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::Simple
    }
}

impl StrategyConfig {
    pub const DEFAULT_MAX_PASSES: usize = 20;

    pub fn recursive() -> Self {
        Self::Recursive {
            max_passes: Self::DEFAULT_MAX_PASSES,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Simple => StrategyKind::Simple,
            Self::Recursive { .. } => StrategyKind::Recursive,
            Self::Differential { .. } => StrategyKind::Differential,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Simple => Ok(()),
            Self::Recursive { max_passes } | Self::Differential { recursive_passes: Some(max_passes), .. }
                if *max_passes == 0 =>
            {
                Err(ConfigError::InvalidStrategy {
                    message: "recursive sweeps need at least one pass".to_string(),
                })
            }
            Self::Recursive { .. } => Ok(()),
            Self::Differential { specs, .. } => {
                if specs.is_empty() {
                    return Err(ConfigError::InvalidStrategy {
                        message: "differential sweep declares no differential parameters".to_string(),
                    });
                }
                let mut seen = HashSet::new();
                for spec in specs {
                    if !seen.insert(spec.key.as_str()) {
                        return Err(ConfigError::DuplicateKey {
                            key: spec.key.clone(),
                        });
                    }
                    spec.validate()?;
                }
                Ok(())
            }
        }
    }
}

/// Top-level configuration for one sweep call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    pub name: String,
    /// Requested number of samples (successful samples for recursive sweeps).
    pub count: usize,
    /// `None` draws a fresh entropy seed.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub latin_hypercube: bool,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub partition: PartitionScheme,
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Every rank writes its local results here before gathering.
    #[serde(default)]
    pub debug_dump_dir: Option<PathBuf>,
}

impl SweepConfig {
    pub fn new(name: impl Into<String>, count: usize) -> Self {
        Self {
            name: name.into(),
            count,
            seed: None,
            latin_hypercube: false,
            strategy: StrategyConfig::Simple,
            backend: BackendConfig::Serial,
            partition: PartitionScheme::Contiguous,
            executor: ExecutorConfig::default(),
            debug_dump_dir: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_latin_hypercube(mut self, enabled: bool) -> Self {
        self.latin_hypercube = enabled;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyConfig) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_partition(mut self, partition: PartitionScheme) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_debug_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.debug_dump_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Other("sweep name must not be empty".to_string()));
        }
        if self.count == 0 {
            return Err(ConfigError::ZeroCount);
        }
        self.backend.validate()?;
        self.strategy.validate()
    }

    /// Load a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backend_is_serial() {
        let config = SweepConfig::new("s", 4);
        assert_eq!(config.backend.kind(), BackendKind::Serial);
        assert_eq!(config.strategy.kind(), StrategyKind::Simple);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let config = SweepConfig::new("s", 4).with_backend(BackendConfig::process_pool(0));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBackend { .. })
        ));

        let mut runtime = TaskRuntimeConfig::default();
        runtime.max_concurrent_tasks = 0;
        assert!(BackendConfig::TaskRuntime(runtime).validate().is_err());
    }

    #[test]
    fn recursive_needs_a_pass() {
        let strategy = StrategyConfig::Recursive { max_passes: 0 };
        assert!(strategy.validate().is_err());
        assert!(StrategyConfig::recursive().validate().is_ok());
    }

    #[test]
    fn differential_specs_validated() {
        let strategy = StrategyConfig::Differential {
            specs: vec![DifferentialSpec::absolute("a", -1.0, 3)],
            recursive_passes: None,
        };
        assert!(strategy.validate().is_err());

        let strategy = StrategyConfig::Differential {
            specs: vec![
                DifferentialSpec::absolute("a", 0.1, 3),
                DifferentialSpec::relative("a", 0.1, 3),
            ],
            recursive_passes: None,
        };
        assert!(matches!(
            strategy.validate(),
            Err(ConfigError::DuplicateKey { .. })
        ));

        let strategy = StrategyConfig::Differential {
            specs: vec![],
            recursive_passes: None,
        };
        assert!(strategy.validate().is_err());
    }

    #[test]
    fn perturbation_half_width() {
        assert_eq!(Perturbation::Absolute { delta: 0.5 }.half_width(-10.0), 0.5);
        assert_eq!(Perturbation::Relative { fraction: 0.1 }.half_width(-10.0), 1.0);
    }

    #[test]
    fn config_json_round_trip() {
        let config = SweepConfig::new("round_trip", 8)
            .with_seed(7)
            .with_latin_hypercube(true)
            .with_strategy(StrategyConfig::recursive())
            .with_backend(BackendConfig::TaskRuntime(TaskRuntimeConfig::default()))
            .with_partition(PartitionScheme::RoundRobin);

        let json = serde_json::to_string(&config).unwrap();
        let back: SweepConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn minimal_json_uses_defaults() {
        let config: SweepConfig = serde_json::from_str(r#"{"name": "minimal", "count": 3}"#).unwrap();
        assert_eq!(config.backend, BackendConfig::Serial);
        assert_eq!(config.partition, PartitionScheme::Contiguous);
        assert!(config.executor.check_failures);
        assert!(config.seed.is_none());
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.json");
        std::fs::write(
            &path,
            r#"{"name": "file", "count": 5, "backend": {"backend": "process_pool", "workers": 2}}"#,
        )
        .unwrap();

        let config = SweepConfig::from_json_file(&path).unwrap();
        assert_eq!(config.backend, BackendConfig::process_pool(2));
    }

    #[test]
    fn pool_retries_configurable() {
        let backend: BackendConfig =
            serde_json::from_str(r#"{"backend": "futures_pool", "workers": 3, "max_retries": 4}"#).unwrap();
        assert_eq!(
            backend,
            BackendConfig::FuturesPool {
                workers: 3,
                max_retries: 4
            }
        );
        assert!(backend.validate().is_ok());

        let backend: BackendConfig = serde_json::from_str(r#"{"backend": "process_pool", "workers": 2}"#).unwrap();
        assert_eq!(backend, BackendConfig::process_pool(2));
        assert!(matches!(
            backend,
            BackendConfig::ProcessPool { max_retries, .. } if max_retries == DEFAULT_BLOCK_RETRIES
        ));
    }
}
