//! Calibrations and their lifecycle.

use crate::algorithm::{AlgorithmResult, AlgorithmRunner, ResultCode};
use crate::collector::CollectorSpec;
use crate::error::{CafError, Result};
use crate::job::BackendArgs;
use caf_core::Iov;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// Why a calibration ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    BackendUnavailable { message: String },
    CollectionFailed { message: String },
    AlgorithmFailure { algorithm: String, message: String },
    NotEnoughData { algorithm: String },
    IterationExhausted { max_iterations: u32 },
    Timeout { limit_seconds: f64 },
    BlockedByAncestor { ancestor: String },
    Internal { message: String },
}

impl FailureReason {
    pub fn from_error(err: &CafError) -> Self {
        match err {
            CafError::BackendUnavailable { .. } => FailureReason::BackendUnavailable {
                message: err.to_string(),
            },
            CafError::CollectionFailed { .. } => FailureReason::CollectionFailed {
                message: err.to_string(),
            },
            CafError::AlgorithmFailure { algorithm, reason } => FailureReason::AlgorithmFailure {
                algorithm: algorithm.clone(),
                message: reason.clone(),
            },
            CafError::IterationExhausted { max_iterations, .. } => FailureReason::IterationExhausted {
                max_iterations: *max_iterations,
            },
            CafError::Timeout { limit, .. } => FailureReason::Timeout {
                limit_seconds: limit.as_secs_f64(),
            },
            other => FailureReason::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::BackendUnavailable { message } => write!(f, "backend unavailable: {}", message),
            FailureReason::CollectionFailed { message } => write!(f, "{}", message),
            FailureReason::AlgorithmFailure { algorithm, message } => {
                write!(f, "algorithm {} failed: {}", algorithm, message)
            }
            FailureReason::NotEnoughData { algorithm } => {
                write!(f, "algorithm {} reported not enough data", algorithm)
            }
            FailureReason::IterationExhausted { max_iterations } => {
                write!(f, "no convergence after {} iterations", max_iterations)
            }
            FailureReason::Timeout { limit_seconds } => write!(f, "timed out after {}s", limit_seconds),
            FailureReason::BlockedByAncestor { ancestor } => {
                write!(f, "blocked by failed dependency {}", ancestor)
            }
            FailureReason::Internal { message } => write!(f, "{}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationState {
    Created,
    Waiting,
    Ready,
    Collecting,
    Running,
    Done,
    Failed(FailureReason),
}

impl CalibrationState {
    pub fn name(&self) -> &'static str {
        match self {
            CalibrationState::Created => "created",
            CalibrationState::Waiting => "waiting",
            CalibrationState::Ready => "ready",
            CalibrationState::Collecting => "collecting",
            CalibrationState::Running => "running",
            CalibrationState::Done => "done",
            CalibrationState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CalibrationState::Done | CalibrationState::Failed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CalibrationState::Failed(_))
    }

    fn allows(&self, to: &CalibrationState) -> bool {
        use CalibrationState::*;
        matches!(
            (self, to),
            (Created, Waiting)
                | (Created, Ready)
                | (Waiting, Ready)
                | (Waiting, Failed(_))
                | (Ready, Collecting)
                | (Ready, Failed(_))
                | (Collecting, Running)
                | (Collecting, Failed(_))
                | (Running, Running)
                | (Running, Collecting)
                | (Running, Done)
                | (Running, Failed(_))
        )
    }
}

impl fmt::Display for CalibrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationState::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    /// Driver-wide ordering of transitions.
    pub sequence: u64,
    pub from: String,
    pub to: String,
    pub iteration: u32,
    pub at: DateTime<Utc>,
}

/// Outcome of evaluating one iteration's algorithm results.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Converged,
    Iterate,
    Failed(FailureReason),
}

#[derive(Debug)]
pub struct Calibration {
    name: String,
    pub collector: CollectorSpec,
    algorithms: Vec<AlgorithmRunner>,
    pub input_files: Vec<String>,
    dependencies: Vec<String>,
    pub max_iterations: u32,
    pub timeout: Option<Duration>,
    pub iov_to_calibrate: Option<Iov>,
    /// When non-empty, the only payload names algorithms may produce.
    pub payload_names: Vec<String>,
    /// Rerun the collector (not just the algorithms) when iterating.
    pub recollect_on_iteration: bool,
    pub backend_args: BackendArgs,
    state: CalibrationState,
    iteration: u32,
    history: Vec<StateChange>,
    results: BTreeMap<u32, Vec<AlgorithmResult>>,
}

impl Calibration {
    pub fn new(name: impl Into<String>, collector: CollectorSpec) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.contains(|c: char| c.is_whitespace() || c == '/' || c == '\\') {
            return Err(CafError::InvalidConfig(format!(
                "calibration name '{}' must be non-empty without whitespace or path separators",
                name
            )));
        }
        Ok(Self {
            name,
            collector,
            algorithms: Vec::new(),
            input_files: Vec::new(),
            dependencies: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            timeout: None,
            iov_to_calibrate: None,
            payload_names: Vec::new(),
            recollect_on_iteration: false,
            backend_args: BackendArgs::default(),
            state: CalibrationState::Created,
            iteration: 0,
            history: Vec::new(),
            results: BTreeMap::new(),
        })
    }

    pub fn with_algorithm(mut self, runner: AlgorithmRunner) -> Self {
        self.algorithms.push(runner);
        self
    }

    pub fn with_input_files(mut self, files: Vec<String>) -> Self {
        self.input_files = files;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn add_algorithm(&mut self, runner: AlgorithmRunner) {
        self.algorithms.push(runner);
    }

    pub fn depends_on(&mut self, other: &Calibration) -> Result<()> {
        self.depends_on_name(other.name())
    }

    /// Registers a dependency by name; the driver checks that it exists.
    pub fn depends_on_name(&mut self, name: &str) -> Result<()> {
        if name == self.name {
            return Err(CafError::SelfDependency(self.name.clone()));
        }
        if !self.dependencies.iter().any(|d| d == name) {
            self.dependencies.push(name.to_string());
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn algorithms(&self) -> &[AlgorithmRunner] {
        &self.algorithms
    }

    pub fn algorithms_mut(&mut self) -> &mut [AlgorithmRunner] {
        &mut self.algorithms
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    pub fn results(&self, iteration: u32) -> Option<&[AlgorithmResult]> {
        self.results.get(&iteration).map(Vec::as_slice)
    }

    /// Number of iterations whose algorithm results were evaluated.
    pub fn attempts(&self) -> usize {
        self.results.len()
    }

    /// Results of the iteration that ended the calibration.
    pub fn final_results(&self) -> Option<&[AlgorithmResult]> {
        self.results.values().next_back().map(Vec::as_slice)
    }

    /// Checks everything that can be checked before a run starts.
    pub fn validate(&self) -> Result<()> {
        self.collector.validate()?;
        if self.algorithms.is_empty() {
            return Err(CafError::InvalidConfig(format!(
                "calibration '{}' has no algorithms",
                self.name
            )));
        }
        if self.max_iterations == 0 {
            return Err(CafError::InvalidConfig(format!(
                "calibration '{}' needs max_iterations >= 1",
                self.name
            )));
        }
        if self.input_files.is_empty() {
            return Err(CafError::InvalidConfig(format!(
                "calibration '{}' has no input files",
                self.name
            )));
        }
        if matches!(self.timeout, Some(t) if t.is_zero()) {
            return Err(CafError::InvalidConfig(format!(
                "calibration '{}' has a zero timeout",
                self.name
            )));
        }
        Ok(())
    }

    pub(crate) fn transition(&mut self, to: CalibrationState, sequence: u64) -> Result<()> {
        if !self.state.allows(&to) {
            return Err(CafError::InvalidTransition {
                calibration: self.name.clone(),
                from: self.state.name().to_string(),
                to: to.name().to_string(),
            });
        }
        info!(
            calibration = %self.name,
            iteration = self.iteration,
            from = self.state.name(),
            to = %to,
            "calibration state change"
        );
        self.history.push(StateChange {
            sequence,
            from: self.state.name().to_string(),
            to: to.name().to_string(),
            iteration: self.iteration,
            at: Utc::now(),
        });
        self.state = to;
        Ok(())
    }

    pub(crate) fn advance_iteration(&mut self) {
        self.iteration += 1;
    }

    /// Combines the results of the current iteration into a verdict.
    pub(crate) fn evaluate(&mut self, results: Vec<AlgorithmResult>) -> Verdict {
        let verdict = self.judge(&results);
        self.results.insert(self.iteration, results);
        verdict
    }

    fn judge(&self, results: &[AlgorithmResult]) -> Verdict {
        if let Some(failed) = results.iter().find(|r| r.code == ResultCode::Failure) {
            return Verdict::Failed(FailureReason::AlgorithmFailure {
                algorithm: failed.algorithm.clone(),
                message: failed
                    .message
                    .clone()
                    .unwrap_or_else(|| "algorithm returned failure".to_string()),
            });
        }
        if let Some(short) = results.iter().find(|r| r.code == ResultCode::NotEnoughData) {
            return Verdict::Failed(FailureReason::NotEnoughData {
                algorithm: short.algorithm.clone(),
            });
        }
        if !self.payload_names.is_empty() {
            for result in results {
                if let Some(extra) = result.payloads.keys().find(|p| !self.payload_names.contains(p)) {
                    return Verdict::Failed(FailureReason::AlgorithmFailure {
                        algorithm: result.algorithm.clone(),
                        message: format!("produced undeclared payload {}", extra),
                    });
                }
            }
        }
        if results.iter().any(|r| r.code == ResultCode::IterationNeeded) {
            if self.iteration + 1 >= self.max_iterations {
                return Verdict::Failed(FailureReason::from_error(&CafError::IterationExhausted {
                    calibration: self.name.clone(),
                    max_iterations: self.max_iterations,
                }));
            }
            return Verdict::Iterate;
        }
        Verdict::Converged
    }
}
