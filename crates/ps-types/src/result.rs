//! Sweep-level result tables and their metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{BackendKind, StrategyKind};
use crate::record::{OutputDef, RunRecord, RunStatus};

/// Unique sweep identifier.
pub type SweepId = Uuid;

/// Non-fatal annotations attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SweepWarning {
    /// The recursive sweep hit its pass bound before reaching the requested
    /// number of successful runs.
    ResamplingExhausted {
        requested: usize,
        achieved: usize,
        passes: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepMetadata {
    pub id: SweepId,
    pub name: String,
    pub strategy: StrategyKind,
    pub backend: BackendKind,
    pub requested: usize,
    pub achieved: usize,
    pub passes: usize,
    pub elapsed_seconds: f64,
    pub started_at: DateTime<Utc>,
    /// Failed outputs were replaced by interpolated estimates.
    pub interpolated: bool,
}

impl SweepMetadata {
    pub fn new(name: impl Into<String>, strategy: StrategyKind, backend: BackendKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            strategy,
            backend,
            requested: 0,
            achieved: 0,
            passes: 0,
            elapsed_seconds: 0.0,
            started_at: Utc::now(),
            interpolated: false,
        }
    }
}

/// The full table of runs of one sweep, in deterministic run order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub metadata: SweepMetadata,
    pub parameter_keys: Vec<String>,
    pub outputs: Vec<OutputDef>,
    pub records: Vec<RunRecord>,
    pub warnings: Vec<SweepWarning>,
}

impl SweepResult {
    pub fn new(metadata: SweepMetadata, parameter_keys: Vec<String>, outputs: Vec<OutputDef>) -> Self {
        Self {
            metadata,
            parameter_keys,
            outputs,
            records: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn success_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_success()).count()
    }

    pub fn count_by_status(&self, status: RunStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    /// Whether every requested run succeeded.
    ///
    /// Callers must check this (or the per-run status) before treating the
    /// outputs as fully populated.
    pub fn is_complete(&self) -> bool {
        self.metadata.achieved >= self.metadata.requested
    }

    pub fn is_exhausted(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, SweepWarning::ResamplingExhausted { .. }))
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|o| o.name == name)
    }

    pub fn parameter_index(&self, key: &str) -> Option<usize> {
        self.parameter_keys.iter().position(|k| k == key)
    }

    pub fn successful(&self) -> impl Iterator<Item = &RunRecord> {
        self.records.iter().filter(|r| r.is_success())
    }

    /// Renumber records so `index` matches table position.
    pub fn reindex(&mut self) {
        for (i, record) in self.records.iter_mut().enumerate() {
            record.index = i;
        }
    }
}

/// Nominal and perturbed tables of a differential sweep.
///
/// Every differential record carries the index of the nominal record it
/// perturbs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferentialSweepResult {
    pub nominal: SweepResult,
    pub differential: SweepResult,
}

impl DifferentialSweepResult {
    /// Differential runs derived from one nominal sample.
    pub fn perturbations_of(&self, nominal_index: usize) -> impl Iterator<Item = &RunRecord> {
        self.differential
            .records
            .iter()
            .filter(move |r| r.nominal_index == Some(nominal_index))
    }
}
