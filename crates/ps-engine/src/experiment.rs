//! The user-supplied experiment: model callbacks, sweep dimensions and
//! declared outputs.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use ps_types::{
    validate_specs, ConfigError, EvalOptions, ModelConfig, OutputDef, OutputValue, SampleSpec, SolveStatus,
    SweepParameter, TerminationCondition,
};

pub type BuildFn<M> = Arc<dyn Fn(&ModelConfig) -> anyhow::Result<M> + Send + Sync>;
pub type HookFn<M> = Arc<dyn Fn(&mut M) -> anyhow::Result<()> + Send + Sync>;
pub type EvaluateFn<M> = Arc<dyn Fn(&mut M, &EvalOptions) -> anyhow::Result<SolveStatus> + Send + Sync>;
pub type SuccessFn = Arc<dyn Fn(&SolveStatus) -> bool + Send + Sync>;
pub type ExtractFn<M> = Arc<dyn Fn(&M) -> OutputValue + Send + Sync>;

/// A declared output and the accessor that reads it from a solved model.
pub struct SweepOutput<M> {
    pub def: OutputDef,
    pub extract: ExtractFn<M>,
}

impl<M> Clone for SweepOutput<M> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            extract: Arc::clone(&self.extract),
        }
    }
}

/// Everything the executor needs to run one configuration.
///
/// The model type `M` is opaque: the engine only ever touches it through
/// these callbacks.
pub struct Experiment<M> {
    pub build: BuildFn<M>,
    pub initialize: Option<HookFn<M>>,
    pub evaluate: EvaluateFn<M>,
    pub reinitialize: Option<HookFn<M>>,
    pub success: SuccessFn,
    pub parameters: Vec<SweepParameter<M>>,
    pub outputs: Vec<SweepOutput<M>>,
}

impl<M> Experiment<M> {
    pub fn new<B, E>(build: B, evaluate: E) -> Self
    where
        B: Fn(&ModelConfig) -> anyhow::Result<M> + Send + Sync + 'static,
        E: Fn(&mut M, &EvalOptions) -> anyhow::Result<SolveStatus> + Send + Sync + 'static,
    {
        Self {
            build: Arc::new(build),
            initialize: None,
            evaluate: Arc::new(evaluate),
            reinitialize: None,
            success: Arc::new(|status: &SolveStatus| status.termination == TerminationCondition::Optimal),
            parameters: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_parameter<F>(mut self, spec: SampleSpec, apply: F) -> Self
    where
        F: Fn(&mut M, f64) + Send + Sync + 'static,
    {
        self.parameters.push(SweepParameter::new(spec, apply));
        self
    }

    pub fn with_output<F>(mut self, def: OutputDef, extract: F) -> Self
    where
        F: Fn(&M) -> OutputValue + Send + Sync + 'static,
    {
        self.outputs.push(SweepOutput {
            def,
            extract: Arc::new(extract),
        });
        self
    }

    pub fn with_initialize<F>(mut self, initialize: F) -> Self
    where
        F: Fn(&mut M) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.initialize = Some(Arc::new(initialize));
        self
    }

    /// Callback used to recover a failed run, and to reset a reused model
    /// between runs.
    pub fn with_reinitialize<F>(mut self, reinitialize: F) -> Self
    where
        F: Fn(&mut M) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.reinitialize = Some(Arc::new(reinitialize));
        self
    }

    pub fn with_success_predicate<F>(mut self, success: F) -> Self
    where
        F: Fn(&SolveStatus) -> bool + Send + Sync + 'static,
    {
        self.success = Arc::new(success);
        self
    }

    pub fn specs(&self) -> Vec<SampleSpec> {
        self.parameters.iter().map(|p| p.spec.clone()).collect()
    }

    pub fn parameter_keys(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.key().to_string()).collect()
    }

    pub fn output_defs(&self) -> Vec<OutputDef> {
        self.outputs.iter().map(|o| o.def.clone()).collect()
    }

    /// Check parameter and output declarations against a sample count.
    pub fn validate(&self, count: usize) -> Result<(), ConfigError> {
        validate_specs(&self.specs(), count)?;
        let mut seen = HashSet::new();
        for output in &self.outputs {
            if !seen.insert(output.def.name.as_str()) {
                return Err(ConfigError::DuplicateOutput {
                    name: output.def.name.clone(),
                });
            }
        }
        Ok(())
    }
}

impl<M> Clone for Experiment<M> {
    fn clone(&self) -> Self {
        Self {
            build: Arc::clone(&self.build),
            initialize: self.initialize.clone(),
            evaluate: Arc::clone(&self.evaluate),
            reinitialize: self.reinitialize.clone(),
            success: Arc::clone(&self.success),
            parameters: self.parameters.clone(),
            outputs: self.outputs.clone(),
        }
    }
}

impl<M> fmt::Debug for Experiment<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("parameters", &self.parameter_keys())
            .field("outputs", &self.outputs.iter().map(|o| &o.def.name).collect::<Vec<_>>())
            .field("initialize", &self.initialize.is_some())
            .field("reinitialize", &self.reinitialize.is_some())
            .finish_non_exhaustive()
    }
}
