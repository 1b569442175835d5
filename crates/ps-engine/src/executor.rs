//! Runs single configurations of an [`Experiment`] and classifies the
//! outcome.

use std::sync::Arc;

use tracing::{debug, warn};

use ps_types::{
    ApplyOrder, ExecutorConfig, OutputDef, OutputKind, OutputValue, RunRecord, RunStatus, SolveStatus,
    TerminationCondition,
};

use crate::experiment::Experiment;

/// Result of one evaluate call.
struct Attempt {
    status: Option<SolveStatus>,
    success: bool,
    diagnostic: Option<String>,
}

/// Executes runs on whatever worker it is handed to.
///
/// Holds no mutable state: each run either builds its own model or, with
/// `reuse_model`, shares one model across the runs of a single block.
pub struct RunExecutor<M> {
    experiment: Arc<Experiment<M>>,
    config: ExecutorConfig,
}

impl<M> RunExecutor<M> {
    pub fn new(experiment: Arc<Experiment<M>>, config: ExecutorConfig) -> Self {
        Self { experiment, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn experiment(&self) -> &Arc<Experiment<M>> {
        &self.experiment
    }

    /// Run one input tuple on a freshly built model.
    pub fn execute(&self, inputs: &[f64]) -> RunRecord {
        match (self.experiment.build)(&self.config.model_config) {
            Ok(mut model) => self.run_on(&mut model, inputs, false),
            Err(e) => self.build_failure(inputs, &e),
        }
    }

    /// Run every tuple of a work block, in order.
    pub fn execute_block<'a, I>(&self, tuples: I) -> Vec<RunRecord>
    where
        I: IntoIterator<Item = &'a [f64]>,
    {
        if !self.config.reuse_model {
            return tuples.into_iter().map(|inputs| self.execute(inputs)).collect();
        }

        let mut model: Option<anyhow::Result<M>> = None;
        let mut records = Vec::new();
        for (i, inputs) in tuples.into_iter().enumerate() {
            let built = model.get_or_insert_with(|| (self.experiment.build)(&self.config.model_config));
            let record = match built {
                Ok(m) => self.run_on(m, inputs, i > 0),
                Err(e) => self.build_failure(inputs, e),
            };
            records.push(record);
        }
        records
    }

    fn build_failure(&self, inputs: &[f64], error: &anyhow::Error) -> RunRecord {
        warn!("Model build failed: {:#}", error);
        let mut record = RunRecord::new(inputs.to_vec(), self.sentinels(), RunStatus::Failed);
        record.diagnostic = Some(format!("model build failed: {error:#}"));
        record
    }

    fn sentinels(&self) -> Vec<OutputValue> {
        self.experiment.outputs.iter().map(|o| o.def.sentinel()).collect()
    }

    fn apply(&self, model: &mut M, inputs: &[f64]) {
        for (param, &value) in self.experiment.parameters.iter().zip(inputs) {
            (param.apply)(model, value);
        }
    }

    fn prepare(&self, model: &mut M, inputs: &[f64]) -> anyhow::Result<()> {
        match self.config.apply_order {
            ApplyOrder::ApplyThenInitialize => {
                self.apply(model, inputs);
                if let Some(initialize) = &self.experiment.initialize {
                    initialize(model)?;
                }
            }
            ApplyOrder::InitializeThenApply => {
                if let Some(initialize) = &self.experiment.initialize {
                    initialize(model)?;
                }
                self.apply(model, inputs);
            }
        }
        Ok(())
    }

    fn evaluate(&self, model: &mut M) -> Attempt {
        match (self.experiment.evaluate)(model, &self.config.eval_options) {
            Ok(status) => Attempt {
                success: (self.experiment.success)(&status),
                diagnostic: status.message.clone(),
                status: Some(status),
            },
            Err(e) => Attempt {
                status: None,
                success: false,
                diagnostic: Some(format!("evaluation failed: {e:#}")),
            },
        }
    }

    fn run_on(&self, model: &mut M, inputs: &[f64], reset: bool) -> RunRecord {
        if reset {
            if let Some(reinitialize) = &self.experiment.reinitialize {
                if let Err(e) = reinitialize(model) {
                    let mut record = RunRecord::new(inputs.to_vec(), self.sentinels(), RunStatus::Failed);
                    record.diagnostic = Some(format!("reinitialization failed: {e:#}"));
                    return record;
                }
            }
        }

        let mut attempt = match self.prepare(model, inputs) {
            Ok(()) => self.evaluate(model),
            Err(e) => Attempt {
                status: None,
                success: false,
                diagnostic: Some(format!("initialization failed: {e:#}")),
            },
        };

        if !attempt.success && self.config.recover_failures {
            if let Some(reinitialize) = &self.experiment.reinitialize {
                debug!("Run failed, reinitializing and retrying once");
                attempt = match reinitialize(model) {
                    Ok(()) => self.evaluate(model),
                    Err(e) => Attempt {
                        diagnostic: Some(format!("recovery failed: {e:#}")),
                        ..attempt
                    },
                };
            }
        }

        let status = if attempt.success {
            RunStatus::Success
        } else if attempt
            .status
            .as_ref()
            .is_some_and(|s| s.termination == TerminationCondition::Infeasible)
        {
            RunStatus::Infeasible
        } else {
            RunStatus::Failed
        };

        let mut diagnostic = attempt.diagnostic;
        let outputs = if attempt.success || !self.config.check_failures {
            self.experiment
                .outputs
                .iter()
                .map(|output| {
                    let value = (output.extract)(&*model);
                    conform(&output.def, value).unwrap_or_else(|| {
                        diagnostic.get_or_insert_with(|| format!("output {} has the wrong shape", output.def.name));
                        output.def.sentinel()
                    })
                })
                .collect()
        } else {
            self.sentinels()
        };

        let mut record = RunRecord::new(inputs.to_vec(), outputs, status);
        record.termination = attempt.status.map(|s| s.termination);
        record.diagnostic = diagnostic;
        record
    }
}

/// Accept an extracted value only if it has the declared shape.
fn conform(def: &OutputDef, value: OutputValue) -> Option<OutputValue> {
    match (def.kind, value) {
        (OutputKind::Scalar, v @ OutputValue::Scalar(_)) => Some(v),
        (OutputKind::Array { len }, OutputValue::Array(values)) if values.len() == len => {
            Some(OutputValue::Array(values))
        }
        _ => None,
    }
}
