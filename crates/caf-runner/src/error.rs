//! Error types for calibration orchestration.

use std::path::PathBuf;
use std::time::Duration;

/// The result type used throughout caf-runner.
pub type Result<T> = std::result::Result<T, CafError>;

#[derive(Debug, thiserror::Error)]
pub enum CafError {
    /// The backend cannot accept jobs (missing scheduler client, shell, ...).
    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("calibration '{0}' is already registered")]
    DuplicateName(String),

    #[error("calibration '{calibration}' depends on unknown calibration '{dependency}'")]
    UnknownDependency {
        calibration: String,
        dependency: String,
    },

    #[error("calibration '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("cyclic dependency between calibrations: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("collection '{job}' failed: {reason}")]
    CollectionFailed { job: String, reason: String },

    #[error("algorithm '{algorithm}' failed: {reason}")]
    AlgorithmFailure { algorithm: String, reason: String },

    #[error("calibration '{calibration}' still requested iteration after {max_iterations} attempts")]
    IterationExhausted {
        calibration: String,
        max_iterations: u32,
    },

    #[error("calibration '{calibration}' exceeded its timeout of {limit:?}")]
    Timeout { calibration: String, limit: Duration },

    #[error("invalid transition for calibration '{calibration}': {from} -> {to}")]
    InvalidTransition {
        calibration: String,
        from: String,
        to: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("output directory {} already exists", .0.display())]
    OutputDirExists(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Iov(#[from] caf_core::IovError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CafError {
    /// Configuration errors abort the whole run before any job is submitted.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            CafError::DuplicateName(_)
                | CafError::UnknownDependency { .. }
                | CafError::SelfDependency(_)
                | CafError::CyclicDependency { .. }
                | CafError::InvalidConfig(_)
                | CafError::OutputDirExists(_)
        )
    }
}
