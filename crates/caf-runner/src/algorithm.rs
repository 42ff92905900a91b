//! Calibration algorithms and the runner that turns their output into
//! validated [`AlgorithmResult`]s.

use crate::error::{CafError, Result};
use caf_core::{atomic_write_json_pretty, ensure_dir, ExpRun, Iov};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const ALGORITHM_INPUT_FILE: &str = "algorithm_input.json";
pub const ALGORITHM_RESULT_FILE: &str = "algorithm_result.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Ok,
    NotEnoughData,
    #[serde(rename = "iterate", alias = "iteration_needed")]
    IterationNeeded,
    Failure,
}

impl ResultCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Ok => "ok",
            ResultCode::NotEnoughData => "not_enough_data",
            ResultCode::IterationNeeded => "iterate",
            ResultCode::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmResult {
    pub algorithm: String,
    pub code: ResultCode,
    pub payloads: BTreeMap<String, Vec<u8>>,
    /// Always present for `Ok` and `IterationNeeded`.
    pub iov: Option<Iov>,
    pub runs: Vec<ExpRun>,
    /// Why the result is a `Failure`, when the runner decided it.
    pub message: Option<String>,
}

/// Wall-clock limit an algorithm must finish within.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub at: Instant,
    pub limit: Duration,
}

impl Deadline {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// Everything an algorithm may read.
#[derive(Debug, Clone)]
pub struct AlgorithmInput {
    pub calibration: String,
    pub collector_outputs: Vec<PathBuf>,
    /// Diagnostic output directory of this algorithm.
    pub output_dir: PathBuf,
    /// Local payload stores to consult, highest priority first.
    pub database_chain: Vec<PathBuf>,
    pub deadline: Option<Deadline>,
}

/// What an algorithm reports for one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmOutput {
    pub code: ResultCode,
    pub payloads: BTreeMap<String, Vec<u8>>,
    pub iov: Option<Iov>,
    pub runs_used: Option<Vec<ExpRun>>,
}

impl AlgorithmOutput {
    pub fn new(code: ResultCode) -> Self {
        Self {
            code,
            payloads: BTreeMap::new(),
            iov: None,
            runs_used: None,
        }
    }

    pub fn with_payload(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.payloads.insert(name.into(), bytes.into());
        self
    }

    pub fn with_iov(mut self, iov: Iov) -> Self {
        self.iov = Some(iov);
        self
    }

    pub fn with_runs(mut self, runs: Vec<ExpRun>) -> Self {
        self.runs_used = Some(runs);
        self
    }
}

pub trait Algorithm: Send {
    fn name(&self) -> &str;

    /// Runs present in the collected data, in any order.
    fn runs_in_data(&mut self, input: &AlgorithmInput) -> Result<Vec<ExpRun>>;

    /// Computes payloads from the data of `runs` (empty means all data).
    fn execute(&mut self, input: &AlgorithmInput, runs: &[ExpRun], iteration: u32) -> Result<AlgorithmOutput>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    #[default]
    Whole,
    RunByRun,
}

/// Drives one [`Algorithm`] over a run list.
pub struct AlgorithmRunner {
    algorithm: Box<dyn Algorithm>,
    strategy: ExecutionStrategy,
}

impl std::fmt::Debug for AlgorithmRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgorithmRunner")
            .field("algorithm", &self.algorithm.name())
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl AlgorithmRunner {
    pub fn new(algorithm: Box<dyn Algorithm>) -> Self {
        Self {
            algorithm,
            strategy: ExecutionStrategy::Whole,
        }
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn name(&self) -> &str {
        self.algorithm.name()
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    /// Runs the algorithm over `run_list` (empty: every run in the data),
    /// restricted to `iov_hint` when given.
    pub fn execute(
        &mut self,
        input: &AlgorithmInput,
        run_list: &[ExpRun],
        iteration: u32,
        iov_hint: Option<&Iov>,
    ) -> Result<Vec<AlgorithmResult>> {
        ensure_dir(&input.output_dir)?;
        let mut runs = if run_list.is_empty() {
            self.algorithm.runs_in_data(input)?
        } else {
            run_list.to_vec()
        };
        runs.sort();
        runs.dedup();
        if let Some(hint) = iov_hint {
            runs.retain(|r| hint.contains(*r));
            if runs.is_empty() {
                warn!(algorithm = self.name(), iov = %hint, "no runs inside the requested IoV");
                return Ok(vec![self.result_without_runs(ResultCode::NotEnoughData)]);
            }
        }
        info!(
            calibration = %input.calibration,
            algorithm = self.name(),
            iteration,
            runs = runs.len(),
            strategy = ?self.strategy,
            "executing algorithm"
        );
        match self.strategy {
            ExecutionStrategy::Whole => Ok(vec![self.execute_block(input, &runs, iteration)?]),
            ExecutionStrategy::RunByRun => self.execute_run_by_run(input, &runs, iteration),
        }
    }

    fn result_without_runs(&self, code: ResultCode) -> AlgorithmResult {
        AlgorithmResult {
            algorithm: self.name().to_string(),
            code,
            payloads: BTreeMap::new(),
            iov: None,
            runs: Vec::new(),
            message: None,
        }
    }

    fn execute_block(&mut self, input: &AlgorithmInput, runs: &[ExpRun], iteration: u32) -> Result<AlgorithmResult> {
        let output = self.algorithm.execute(input, runs, iteration)?;
        let mut used = output.runs_used.clone().unwrap_or_else(|| runs.to_vec());
        used.sort();
        used.dedup();
        let mut result = AlgorithmResult {
            algorithm: self.name().to_string(),
            code: output.code,
            payloads: output.payloads,
            iov: None,
            runs: used,
            message: None,
        };
        match result.code {
            ResultCode::Ok | ResultCode::IterationNeeded => match resolve_iov(output.iov, &result.runs) {
                Ok(iov) => result.iov = Some(iov),
                Err(reason) => {
                    warn!(algorithm = %result.algorithm, %reason, "rejecting algorithm result");
                    result.code = ResultCode::Failure;
                    result.message = Some(reason);
                }
            },
            ResultCode::NotEnoughData | ResultCode::Failure => {
                result.iov = output.iov.or_else(|| Iov::from_runs(&result.runs));
            }
        }
        debug!(algorithm = %result.algorithm, code = result.code.as_str(), iov = ?result.iov, "algorithm block finished");
        Ok(result)
    }

    fn execute_run_by_run(&mut self, input: &AlgorithmInput, runs: &[ExpRun], iteration: u32) -> Result<Vec<AlgorithmResult>> {
        if runs.is_empty() {
            return Ok(vec![self.execute_block(input, runs, iteration)?]);
        }
        let mut results: Vec<AlgorithmResult> = Vec::new();
        let mut block: Vec<ExpRun> = Vec::new();
        let mut last_insufficient = None;
        for run in runs {
            block.push(*run);
            let result = self.execute_block(input, &block, iteration)?;
            match result.code {
                ResultCode::NotEnoughData => {
                    last_insufficient = Some(result);
                }
                ResultCode::Ok | ResultCode::IterationNeeded => {
                    results.push(result);
                    block.clear();
                    last_insufficient = None;
                }
                ResultCode::Failure => {
                    results.push(result);
                    return Ok(results);
                }
            }
        }
        if block.is_empty() {
            return Ok(results);
        }
        match results.pop() {
            Some(previous) => {
                let mut merged = previous.runs.clone();
                merged.extend(block.iter().copied());
                debug!(algorithm = self.name(), runs = merged.len(), "merging trailing runs into previous block");
                results.push(self.execute_block(input, &merged, iteration)?);
            }
            None => {
                if let Some(result) = last_insufficient {
                    results.push(result);
                }
            }
        }
        Ok(results)
    }
}

/// IoV of a successful result: the explicit one when valid, otherwise the
/// span of the runs used.
fn resolve_iov(explicit: Option<Iov>, used: &[ExpRun]) -> std::result::Result<Iov, String> {
    let (Some(first), Some(last)) = (used.first().copied(), used.last().copied()) else {
        return match explicit {
            Some(iov) => Err(format!("IoV {} given without any run used", iov)),
            None => Err("no runs used and no IoV given".to_string()),
        };
    };
    let Some(iov) = explicit else {
        return Iov::from_runs(used).ok_or_else(|| "no runs used".to_string());
    };
    if let Some(outside) = used.iter().find(|r| !iov.contains(**r)) {
        return Err(format!("IoV {} does not contain used run {}", iov, outside));
    }
    if iov.low() != first {
        return Err(format!("IoV {} starts before first used run {}", iov, first));
    }
    if let Some(high) = iov.high() {
        if high > last {
            return Err(format!("IoV {} extends beyond last used run {}", iov, last));
        }
    } else if iov.exp_high() != -1 && iov.exp_high() != last.exp {
        // Open run range: only the last used experiment may stay open.
        return Err(format!(
            "IoV {} stays open in experiment {} but the last used run is {}",
            iov,
            iov.exp_high(),
            last
        ));
    }
    Ok(iov)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    #[default]
    Command,
}

/// An `algorithms` entry of a configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlgorithmConfig {
    pub name: String,
    #[serde(default)]
    pub kind: AlgorithmKind,
    pub command: Vec<String>,
    #[serde(default)]
    pub strategy: ExecutionStrategy,
}

impl AlgorithmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.name.contains(&['/', '\\'][..]) {
            return Err(CafError::InvalidConfig(format!("invalid algorithm name '{}'", self.name)));
        }
        if self.command.is_empty() {
            return Err(CafError::InvalidConfig(format!(
                "algorithm '{}' has an empty command",
                self.name
            )));
        }
        Ok(())
    }

    pub fn build(&self) -> Result<AlgorithmRunner> {
        self.validate()?;
        let algorithm: Box<dyn Algorithm> = match self.kind {
            AlgorithmKind::Command => Box::new(CommandAlgorithm::new(self.name.clone(), self.command.clone())),
        };
        Ok(AlgorithmRunner::new(algorithm).with_strategy(self.strategy))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandPayload {
    name: String,
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandResult {
    result: ResultCode,
    #[serde(default)]
    runs: Option<Vec<ExpRun>>,
    #[serde(default)]
    iov: Option<Iov>,
    #[serde(default)]
    payloads: Vec<CommandPayload>,
}

#[derive(Debug, Deserialize)]
struct CommandRuns {
    runs: Vec<ExpRun>,
}

/// An algorithm implemented by an external program.
///
/// The program reads `CAF_ALGORITHM_INPUT` and writes its answer as JSON to
/// `CAF_ALGORITHM_OUTPUT`. With `CAF_MODE=runs` it only lists the runs in
/// the data.
#[derive(Debug, Clone)]
pub struct CommandAlgorithm {
    name: String,
    command: Vec<String>,
    poll_interval: Duration,
}

impl CommandAlgorithm {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            poll_interval: Duration::from_millis(200),
        }
    }

    fn invoke(&self, input: &AlgorithmInput, mode: &str, runs: &[ExpRun], iteration: u32) -> Result<PathBuf> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(CafError::InvalidConfig(format!("algorithm '{}' has an empty command", self.name)));
        };
        let input_path = input.output_dir.join(ALGORITHM_INPUT_FILE);
        let output_path = input.output_dir.join(ALGORITHM_RESULT_FILE);
        atomic_write_json_pretty(
            &input_path,
            &json!({
                "calibration": input.calibration,
                "collector_outputs": input.collector_outputs,
                "database_chain": input.database_chain,
                "iteration": iteration,
            }),
        )?;
        if output_path.exists() {
            fs::remove_file(&output_path)?;
        }
        let stdout = File::create(input.output_dir.join(format!("{}_stdout", mode)))?;
        let stderr = File::create(input.output_dir.join(format!("{}_stderr", mode)))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&input.output_dir)
            .env("CAF_ALGORITHM_INPUT", &input_path)
            .env("CAF_ALGORITHM_OUTPUT", &output_path)
            .env("CAF_RUNS", serde_json::to_string(runs)?)
            .env("CAF_ITERATION", iteration.to_string())
            .env("CAF_MODE", mode)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let status = self.wait_with_deadline(cmd, &input.calibration, input.deadline)?;
        if !status.success() {
            return Err(CafError::AlgorithmFailure {
                algorithm: self.name.clone(),
                reason: format!("command exited with {:?}", status.code()),
            });
        }
        if !output_path.exists() {
            return Err(CafError::AlgorithmFailure {
                algorithm: self.name.clone(),
                reason: format!("command wrote no {}", ALGORITHM_RESULT_FILE),
            });
        }
        Ok(output_path)
    }

    fn wait_with_deadline(&self, mut cmd: Command, calibration: &str, deadline: Option<Deadline>) -> Result<ExitStatus> {
        let mut child = cmd.spawn()?;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if let Some(deadline) = deadline {
                if deadline.is_expired() {
                    warn!(algorithm = %self.name, calibration, "algorithm exceeded deadline; killing");
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CafError::Timeout {
                        calibration: calibration.to_string(),
                        limit: deadline.limit,
                    });
                }
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| CafError::AlgorithmFailure {
            algorithm: self.name.clone(),
            reason: format!("malformed {}: {}", path.display(), e),
        })
    }
}

impl Algorithm for CommandAlgorithm {
    fn name(&self) -> &str {
        &self.name
    }

    fn runs_in_data(&mut self, input: &AlgorithmInput) -> Result<Vec<ExpRun>> {
        let path = self.invoke(input, "runs", &[], 0)?;
        let answer: CommandRuns = self.read_json(&path)?;
        Ok(answer.runs)
    }

    fn execute(&mut self, input: &AlgorithmInput, runs: &[ExpRun], iteration: u32) -> Result<AlgorithmOutput> {
        let path = self.invoke(input, "execute", runs, iteration)?;
        let answer: CommandResult = self.read_json(&path)?;
        let mut output = AlgorithmOutput::new(answer.result);
        output.iov = answer.iov;
        output.runs_used = answer.runs;
        for payload in answer.payloads {
            let file = if payload.path.is_absolute() {
                payload.path
            } else {
                input.output_dir.join(payload.path)
            };
            let bytes = fs::read(&file).map_err(|e| CafError::AlgorithmFailure {
                algorithm: self.name.clone(),
                reason: format!("cannot read payload {} from {}: {}", payload.name, file.display(), e),
            })?;
            output.payloads.insert(payload.name, bytes);
        }
        Ok(output)
    }
}
