use thiserror::Error;

/// Main error type for a sweep call.
///
/// Only the fatal categories live here. Individual run failures are recorded
/// on [`crate::RunRecord::status`] and exhausted resampling is a
/// [`crate::SweepWarning`]; neither interrupts control flow.
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend fault: {0}")]
    Backend(#[from] BackendFault),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SweepError {
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    pub fn is_backend_fault(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Malformed sweep definition, raised before any run executes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("No sweep parameters declared")]
    NoParameters,

    #[error("Duplicate parameter key: {key}")]
    DuplicateKey { key: String },

    #[error("Sample count must be positive")]
    ZeroCount,

    #[error("Sample count mismatch for {key}: expected {expected}, got {actual}")]
    CountMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid distribution for {key}: {message}")]
    InvalidDistribution { key: String, message: String },

    #[error("Unknown parameter key: {key}")]
    UnknownParameter { key: String },

    #[error("Duplicate output name: {name}")]
    DuplicateOutput { name: String },

    #[error("Invalid backend configuration: {message}")]
    InvalidBackend { message: String },

    #[error("Invalid strategy configuration: {message}")]
    InvalidStrategy { message: String },

    #[error("{0}")]
    Other(String),
}

/// Loss of a worker or rank, or a broken communication channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendFault {
    #[error("Rank {rank} disconnected during {operation}")]
    Disconnected { rank: usize, operation: String },

    #[error("Worker for block {block} crashed after {attempts} attempt(s): {message}")]
    WorkerCrashed {
        block: usize,
        attempts: usize,
        message: String,
    },

    #[error("Rank {rank} panicked: {message}")]
    RankPanicked { rank: usize, message: String },

    #[error("Collective {operation} received an unexpected payload from rank {rank}")]
    PayloadMismatch { rank: usize, operation: String },

    #[error("Backend runtime error: {0}")]
    Runtime(String),
}

/// Errors from the persisted result container.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(String),

    #[error("Parquet error: {0}")]
    Parquet(String),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("Sweep group already exists: {path}")]
    GroupExists { path: String },

    #[error("Sweep group not found: {path}")]
    GroupNotFound { path: String },

    #[error("Invalid sweep group path: {path}")]
    InvalidGroup { path: String },

    #[error("Corrupt sweep container: {message}")]
    Corrupt { message: String },
}

/// Result type alias for parasweep operations
pub type Result<T> = std::result::Result<T, SweepError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::ConfigError::Other(format!($($arg)*))
    };
}

/// Render a caught panic payload as text.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::CountMismatch {
            key: "flow".to_string(),
            expected: 4,
            actual: 5,
        };

        assert!(error.to_string().contains("flow"));
        assert!(error.to_string().contains('4'));
        assert!(error.to_string().contains('5'));
    }

    #[test]
    fn test_error_conversion() {
        let fault = BackendFault::Disconnected {
            rank: 2,
            operation: "gather".to_string(),
        };
        let err: SweepError = fault.into();
        assert!(err.is_backend_fault());
        assert!(!err.is_config());

        let err: SweepError = ConfigError::ZeroCount.into();
        assert!(err.is_config());
    }

    #[test]
    fn test_macros() {
        let err = config_error!("bad value: {}", 42);
        assert_eq!(err, ConfigError::Other("bad value: 42".to_string()));
    }

    #[test]
    fn panic_message_handles_both_payloads() {
        let caught = std::panic::catch_unwind(|| {
            panic!("boom");
        })
        .unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "boom");

        let caught = std::panic::catch_unwind(|| {
            panic!("{} {}", "formatted", 1);
        })
        .unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "formatted 1");
    }
}
