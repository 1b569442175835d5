//! Per-run outcomes produced by the run executor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Final classification of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Infeasible,
}

impl RunStatus {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Infeasible => "infeasible",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "infeasible" => Some(Self::Infeasible),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an evaluation terminated, as reported by the external solver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCondition {
    Optimal,
    Infeasible,
    MaxIterations,
    Error,
    Other(String),
}

impl TerminationCondition {
    /// Inverse of `Display`; unknown names become `Other`.
    pub fn parse(s: &str) -> Self {
        match s {
            "optimal" => Self::Optimal,
            "infeasible" => Self::Infeasible,
            "max_iterations" => Self::MaxIterations,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for TerminationCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Optimal => f.write_str("optimal"),
            Self::Infeasible => f.write_str("infeasible"),
            Self::MaxIterations => f.write_str("max_iterations"),
            Self::Error => f.write_str("error"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// Status returned by an evaluation callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveStatus {
    pub termination: TerminationCondition,
    pub message: Option<String>,
}

impl SolveStatus {
    pub fn new(termination: TerminationCondition) -> Self {
        Self {
            termination,
            message: None,
        }
    }

    pub fn optimal() -> Self {
        Self::new(TerminationCondition::Optimal)
    }

    pub fn infeasible() -> Self {
        Self::new(TerminationCondition::Infeasible)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            termination: TerminationCondition::Error,
            message: Some(message.into()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_optimal(&self) -> bool {
        self.termination == TerminationCondition::Optimal
    }
}

/// Shape of a declared output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputKind {
    Scalar,
    /// Fixed-length array; failed runs record `len` NaN sentinels.
    Array { len: usize },
}

/// Declared output column: name, shape and descriptive metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
    pub name: String,
    pub kind: OutputKind,
    pub units: Option<String>,
    pub lower_bound: Option<f64>,
    pub upper_bound: Option<f64>,
}

impl OutputDef {
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: OutputKind::Scalar,
            units: None,
            lower_bound: None,
            upper_bound: None,
        }
    }

    pub fn array(name: impl Into<String>, len: usize) -> Self {
        Self {
            kind: OutputKind::Array { len },
            ..Self::scalar(name)
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn with_bounds(mut self, lower: Option<f64>, upper: Option<f64>) -> Self {
        self.lower_bound = lower;
        self.upper_bound = upper;
        self
    }

    /// Not-a-number placeholder recorded for failed runs.
    pub fn sentinel(&self) -> OutputValue {
        match self.kind {
            OutputKind::Scalar => OutputValue::Scalar(f64::NAN),
            OutputKind::Array { len } => OutputValue::Array(vec![f64::NAN; len]),
        }
    }

    /// Number of flat columns this output occupies in a tabular export.
    pub fn width(&self) -> usize {
        match self.kind {
            OutputKind::Scalar => 1,
            OutputKind::Array { len } => len,
        }
    }
}

/// An extracted output value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    Scalar(f64),
    Array(Vec<f64>),
}

impl OutputValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Array(_) => None,
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        match self {
            Self::Scalar(v) => std::slice::from_ref(v),
            Self::Array(values) => values,
        }
    }

    pub fn has_nan(&self) -> bool {
        self.as_slice().iter().any(|v| v.is_nan())
    }

    /// Bitwise equality, treating NaN sentinels as equal to each other.
    pub fn bit_eq(&self, other: &OutputValue) -> bool {
        let (a, b) = (self.as_slice(), other.as_slice());
        matches!(
            (self, other),
            (Self::Scalar(_), Self::Scalar(_)) | (Self::Array(_), Self::Array(_))
        ) && a.len() == b.len()
            && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
    }
}

impl From<f64> for OutputValue {
    fn from(v: f64) -> Self {
        Self::Scalar(v)
    }
}

impl From<Vec<f64>> for OutputValue {
    fn from(v: Vec<f64>) -> Self {
        Self::Array(v)
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Position in the sweep's global run order.
    pub index: usize,
    /// Recursive pass that produced the run (0 for the first pass).
    pub pass: usize,
    /// Nominal sample this run perturbs, for differential runs.
    pub nominal_index: Option<usize>,
    /// Key perturbed by a differential run.
    pub perturbed: Option<String>,
    /// Input tuple, aligned to the sweep's parameter keys.
    pub inputs: Vec<f64>,
    /// Outputs, aligned to the sweep's output definitions.
    pub outputs: Vec<OutputValue>,
    pub status: RunStatus,
    /// Termination reported by the evaluator, when it ran.
    pub termination: Option<TerminationCondition>,
    pub diagnostic: Option<String>,
}

impl RunRecord {
    pub fn new(inputs: Vec<f64>, outputs: Vec<OutputValue>, status: RunStatus) -> Self {
        Self {
            index: 0,
            pass: 0,
            nominal_index: None,
            perturbed: None,
            inputs,
            outputs,
            status,
            termination: None,
            diagnostic: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
