use thiserror::Error;

/// Main error type for the mltb tool box
#[derive(Error, Debug)]
pub enum MltbError {
    #[error("Tracking error: {0}")]
    Tracking(#[from] TrackingError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Study error: {0}")]
    Study(#[from] StudyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Why a trial did not produce an objective value.
///
/// This is the error type returned by objective functions. The study decides
/// the trial state from the variant: `Pruned` becomes a pruned trial,
/// `Cancelled` stops the whole optimization, everything else is a failure.
#[derive(Error, Debug)]
pub enum TrialError {
    #[error("Trial cancelled by user")]
    Cancelled,

    #[error("Trial pruned at step {step:?}")]
    Pruned { step: Option<u64> },

    #[error("Working tree at {path} has {changes} uncommitted change(s)")]
    DirtyWorkingTree { path: String, changes: usize },

    #[error("Working tree check failed: {message}")]
    GitCheck { message: String },

    #[error("Study error: {0}")]
    Study(#[from] StudyError),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl TrialError {
    /// Build a generic failure from a message.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        TrialError::Failed(anyhow::anyhow!("{message}"))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TrialError::Cancelled)
    }

    pub fn is_pruned(&self) -> bool {
        matches!(self, TrialError::Pruned { .. })
    }
}

/// Search-framework errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StudyError {
    #[error("Invalid distribution for parameter {name}: {message}")]
    InvalidDistribution { name: String, message: String },

    #[error("Parameter {name} was already suggested as {existing}, cannot re-suggest as {requested}")]
    IncompatibleDistribution {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("Trial not found: {number}")]
    TrialNotFound { number: usize },

    #[error("Trial {number} is already finished")]
    TrialFinished { number: usize },

    #[error("No completed trials in study {study_name}")]
    NoCompletedTrials { study_name: String },

    #[error("Invalid study configuration: {message}")]
    InvalidConfig { message: String },
}

/// Tracking-service errors
#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Run {run_id} is not active (status {status})")]
    RunNotActive { run_id: String, status: String },

    #[error("Experiment not found: {experiment_id}")]
    ExperimentNotFound { experiment_id: String },

    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Value for {key:?} has length {length}, exceeding the limit of {limit}")]
    ValueTooLong {
        key: String,
        length: usize,
        limit: usize,
    },

    #[error("Changing param values is not allowed: {key:?} was {old:?}, got {new:?}")]
    ParamChanged { key: String, old: String, new: String },

    #[error("Unsupported tracking URI: {uri}")]
    UnsupportedUri { uri: String },

    #[error("Corrupt tracking record: {message}")]
    Corrupt { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for mltb operations
pub type MltbResult<T> = Result<T, MltbError>;

/// Result type alias for tracking-service operations
pub type TrackingResult<T> = Result<T, TrackingError>;

/// Result type alias for search-framework operations
pub type StudyResult<T> = Result<T, StudyError>;

/// Helper trait for converting string errors
pub trait IntoMltbError {
    fn into_mltb_error(self) -> MltbError;
}

impl IntoMltbError for String {
    fn into_mltb_error(self) -> MltbError {
        MltbError::Internal(self)
    }
}

impl IntoMltbError for &str {
    fn into_mltb_error(self) -> MltbError {
        MltbError::Internal(self.to_string())
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::MltbError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::MltbError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::MltbError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = TrackingError::ValueTooLong {
            key: "notes".to_string(),
            length: 6000,
            limit: 5000,
        };

        assert!(error.to_string().contains("notes"));
        assert!(error.to_string().contains("6000"));
        assert!(error.to_string().contains("5000"));
    }

    #[test]
    fn test_error_conversion() {
        let study_error = StudyError::TrialNotFound { number: 3 };
        let trial_error: TrialError = study_error.into();
        assert!(matches!(trial_error, TrialError::Study(_)));

        let mltb_error: MltbError = trial_error.into();
        match mltb_error {
            MltbError::Trial(TrialError::Study(StudyError::TrialNotFound { number })) => {
                assert_eq!(number, 3)
            }
            other => panic!("Expected Trial error, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_is_transparent() {
        let err = TrialError::msg("loss diverged");
        assert_eq!(err.to_string(), "loss diverged");
        assert!(!err.is_cancelled());
        assert!(TrialError::Cancelled.is_cancelled());
        assert!(TrialError::Pruned { step: Some(2) }.is_pruned());
    }

    #[test]
    fn test_macros() {
        let validation_err = validation_error!("Invalid value: {}", 42);
        assert!(matches!(validation_err, MltbError::Validation(_)));
        let _internal_err = internal_error!("Something went wrong");
        let config_err = config_error!("Missing required field: {}", "tracking_uri");
        assert!(config_err.to_string().contains("tracking_uri"));
    }
}
