//! Calibration orchestration: collector jobs on a batch backend, algorithms
//! iterated to convergence, dependency ordering between calibrations and
//! commits into a local payload store.

pub mod algorithm;
pub mod backend;
pub mod calibration;
pub mod collector;
pub mod config;
pub mod dag;
pub mod driver;
pub mod error;
pub mod job;
pub mod summary;

pub use algorithm::{
    Algorithm, AlgorithmConfig, AlgorithmInput, AlgorithmKind, AlgorithmOutput, AlgorithmResult,
    AlgorithmRunner, CommandAlgorithm, Deadline, ExecutionStrategy, ResultCode,
};
pub use backend::{
    Backend, BackendConfig, BackendKind, BatchBackend, BatchSystem, InMemoryBackend, LocalBackend,
    SimulatedOutcome, SimulationPolicy, SubmissionLog, SubmissionRecord,
};
pub use calibration::{Calibration, CalibrationState, FailureReason, StateChange, DEFAULT_MAX_ITERATIONS};
pub use collector::{CollectorManifest, CollectorRun, CollectorSpec};
pub use config::CafConfig;
pub use dag::DependencyGraph;
pub use driver::{Caf, DriverOptions, DEFAULT_HEARTBEAT};
pub use error::{CafError, Result};
pub use job::{partition_input_files, BackendArgs, Collection, ExitSummary, Job, JobStatus, SubjobSplit};
pub use summary::{CalibrationSummary, CommittedPayload, RunSummary};
