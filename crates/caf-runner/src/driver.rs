//! The orchestration driver.
//!
//! [`Caf`] owns every calibration and a backend. `run()` validates the
//! dependency graph, then polls until each calibration is done or failed,
//! and finally commits the results to `<output_dir>/database`.

use crate::algorithm::{AlgorithmInput, Deadline, ResultCode};
use crate::backend::Backend;
use crate::calibration::{Calibration, CalibrationState, FailureReason, Verdict};
use crate::collector::CollectorRun;
use crate::dag::DependencyGraph;
use crate::error::{CafError, Result};
use crate::job::Collection;
use crate::summary::{CalibrationSummary, CommittedPayload, RunSummary, SUMMARY_FILE};
use caf_core::{ensure_dir, CommitOutcome, PayloadStore};
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);
pub const DEFAULT_OUTPUT_DIR: &str = "calibration_results";
pub const DATABASE_DIR: &str = "database";
pub const OUTPUTDB_DIR: &str = "outputdb";

#[derive(Debug, Clone, PartialEq)]
pub struct DriverOptions {
    pub output_dir: PathBuf,
    /// Sleep between polls when nothing changed.
    pub heartbeat: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }
}

struct ActiveCollection {
    run: CollectorRun,
    collection: Collection,
}

pub struct Caf {
    options: DriverOptions,
    backend: Box<dyn Backend>,
    calibrations: Vec<Calibration>,
    index: HashMap<String, usize>,
    active: HashMap<String, ActiveCollection>,
    started: HashMap<String, Instant>,
    sequence: u64,
    root: PathBuf,
}

impl Caf {
    pub fn new(backend: Box<dyn Backend>, options: DriverOptions) -> Result<Self> {
        if options.heartbeat.is_zero() {
            return Err(CafError::InvalidConfig("heartbeat must be greater than zero".to_string()));
        }
        let root = options.output_dir.clone();
        Ok(Self {
            options,
            backend,
            calibrations: Vec::new(),
            index: HashMap::new(),
            active: HashMap::new(),
            started: HashMap::new(),
            sequence: 0,
            root,
        })
    }

    pub fn add_calibration(&mut self, calibration: Calibration) -> Result<()> {
        if self.index.contains_key(calibration.name()) {
            return Err(CafError::DuplicateName(calibration.name().to_string()));
        }
        self.index.insert(calibration.name().to_string(), self.calibrations.len());
        self.calibrations.push(calibration);
        Ok(())
    }

    pub fn calibrations(&self) -> &[Calibration] {
        &self.calibrations
    }

    pub fn calibration(&self, name: &str) -> Option<&Calibration> {
        self.index.get(name).map(|&i| &self.calibrations[i])
    }

    pub fn calibration_mut(&mut self, name: &str) -> Option<&mut Calibration> {
        self.index.get(name).map(|&i| &mut self.calibrations[i])
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    /// Validates dependencies and returns the order calibrations are
    /// committed in. Has no side effects.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let graph = DependencyGraph::from_dependencies(
            self.calibrations.iter().map(|c| (c.name(), c.dependencies())),
        )?;
        graph.topological_order()
    }

    fn validate(&self) -> Result<Vec<usize>> {
        if self.calibrations.is_empty() {
            return Err(CafError::InvalidConfig("no calibrations registered".to_string()));
        }
        if let Some(started) = self
            .calibrations
            .iter()
            .find(|c| *c.state() != CalibrationState::Created)
        {
            return Err(CafError::InvalidConfig(format!(
                "calibration '{}' has already been run",
                started.name()
            )));
        }
        let order = self.execution_order()?;
        for cal in &self.calibrations {
            cal.validate()?;
        }
        if self.options.output_dir.exists() {
            return Err(CafError::OutputDirExists(self.options.output_dir.clone()));
        }
        Ok(order.iter().filter_map(|n| self.index.get(n).copied()).collect())
    }

    pub fn run(&mut self) -> Result<RunSummary> {
        let order = self.validate()?;
        ensure_dir(&self.options.output_dir)?;
        self.root = fs::canonicalize(&self.options.output_dir)?;
        let started_at = Utc::now();
        info!(
            output_dir = %self.root.display(),
            calibrations = self.calibrations.len(),
            backend = self.backend.kind(),
            "starting calibration run"
        );

        for &i in &order {
            ensure_dir(&self.root.join(self.calibrations[i].name()))?;
            let next = if self.calibrations[i].dependencies().is_empty() {
                CalibrationState::Ready
            } else {
                CalibrationState::Waiting
            };
            self.set_state(i, next)?;
        }

        loop {
            let mut progressed = self.propagate_failures(&order)?;
            progressed |= self.promote_ready(&order)?;
            progressed |= self.submit_ready(&order)?;
            progressed |= self.poll_collections(&order)?;
            progressed |= self.enforce_timeouts(&order)?;
            if self.calibrations.iter().all(|c| c.state().is_terminal()) {
                break;
            }
            if !progressed {
                thread::sleep(self.options.heartbeat);
            }
        }

        let mut committed = self.commit_results(&order)?;
        let summary = RunSummary {
            output_dir: self.root.clone(),
            database: self.root.join(DATABASE_DIR),
            started_at,
            finished_at: Utc::now(),
            order: order.iter().map(|&i| self.calibrations[i].name().to_string()).collect(),
            calibrations: order
                .iter()
                .map(|&i| {
                    let cal = &self.calibrations[i];
                    CalibrationSummary::from_calibration(cal, committed.remove(cal.name()).unwrap_or_default())
                })
                .collect(),
        };
        summary.write(&self.root.join(SUMMARY_FILE))?;
        info!(
            done = summary.calibrations.iter().filter(|c| c.is_done()).count(),
            total = summary.calibrations.len(),
            "calibration run finished"
        );
        Ok(summary)
    }

    fn set_state(&mut self, i: usize, state: CalibrationState) -> Result<()> {
        self.sequence += 1;
        self.calibrations[i].transition(state, self.sequence)
    }

    fn fail(&mut self, i: usize, err: &CafError) -> Result<()> {
        warn!(calibration = %self.calibrations[i].name(), error = %err, "calibration failed");
        self.set_state(i, CalibrationState::Failed(FailureReason::from_error(err)))
    }

    fn state_of(&self, name: &str) -> Option<&CalibrationState> {
        self.calibration(name).map(Calibration::state)
    }

    fn calibration_dir(&self, i: usize) -> PathBuf {
        self.root.join(self.calibrations[i].name())
    }

    fn iteration_outputdb(&self, i: usize, iteration: u32) -> PathBuf {
        self.calibration_dir(i)
            .join(iteration.to_string())
            .join("algorithm_output")
            .join(OUTPUTDB_DIR)
    }

    /// Local stores visible to a calibration, highest priority first: its own
    /// previous iteration, then each dependency's final store.
    fn database_chain(&self, i: usize) -> Vec<PathBuf> {
        let cal = &self.calibrations[i];
        let mut chain = Vec::new();
        if cal.iteration() > 0 {
            chain.push(self.iteration_outputdb(i, cal.iteration() - 1));
        }
        chain.extend(
            cal.dependencies()
                .iter()
                .map(|d| self.root.join(d).join(OUTPUTDB_DIR)),
        );
        chain
    }

    fn deadline_of(&self, i: usize) -> Option<Deadline> {
        let cal = &self.calibrations[i];
        let limit = cal.timeout?;
        let start = self.started.get(cal.name())?;
        // A limit past the end of the clock means no deadline.
        let at = start.checked_add(limit)?;
        Some(Deadline { at, limit })
    }

    fn propagate_failures(&mut self, order: &[usize]) -> Result<bool> {
        let mut changed = false;
        for &i in order {
            if !matches!(self.calibrations[i].state(), CalibrationState::Waiting | CalibrationState::Ready) {
                continue;
            }
            let failed = self.calibrations[i]
                .dependencies()
                .iter()
                .find(|d| self.state_of(d).is_some_and(CalibrationState::is_failed))
                .cloned();
            if let Some(ancestor) = failed {
                self.set_state(i, CalibrationState::Failed(FailureReason::BlockedByAncestor { ancestor }))?;
                changed = true;
            }
        }
        Ok(changed)
    }

    fn promote_ready(&mut self, order: &[usize]) -> Result<bool> {
        let mut changed = false;
        for &i in order {
            if *self.calibrations[i].state() != CalibrationState::Waiting {
                continue;
            }
            let all_done = self.calibrations[i]
                .dependencies()
                .iter()
                .all(|d| self.state_of(d) == Some(&CalibrationState::Done));
            if all_done {
                self.set_state(i, CalibrationState::Ready)?;
                changed = true;
            }
        }
        Ok(changed)
    }

    fn submit_ready(&mut self, order: &[usize]) -> Result<bool> {
        let mut changed = false;
        for &i in order {
            if *self.calibrations[i].state() != CalibrationState::Ready {
                continue;
            }
            match self.start_collection(i) {
                Ok(()) => self.set_state(i, CalibrationState::Collecting)?,
                Err(e) => self.fail(i, &e)?,
            }
            changed = true;
        }
        Ok(changed)
    }

    fn start_collection(&mut self, i: usize) -> Result<()> {
        let chain = self.database_chain(i);
        let cal_dir = self.calibration_dir(i);
        let cal = &self.calibrations[i];
        let name = cal.name().to_string();
        let (run, job) = CollectorRun::prepare(
            &cal.collector,
            &name,
            &cal_dir,
            cal.iteration(),
            &cal.input_files,
            &cal.backend_args,
            &chain,
        )?;
        self.started.entry(name.clone()).or_insert_with(Instant::now);
        let collection = self.backend.submit(job)?;
        self.active.insert(name, ActiveCollection { run, collection });
        Ok(())
    }

    fn poll_collections(&mut self, order: &[usize]) -> Result<bool> {
        let mut changed = false;
        for &i in order {
            if *self.calibrations[i].state() != CalibrationState::Collecting {
                continue;
            }
            let name = self.calibrations[i].name().to_string();
            let Some(active) = self.active.get_mut(&name) else {
                let err = CafError::CollectionFailed {
                    job: name.clone(),
                    reason: "no collection in flight".to_string(),
                };
                self.fail(i, &err)?;
                changed = true;
                continue;
            };
            let polled = self.backend.is_job_finished(&mut active.collection);
            let (finished, summary) = match polled {
                Ok(v) => v,
                Err(e) => {
                    if let Err(kill_err) = self.backend.kill(&mut active.collection) {
                        warn!(calibration = %name, error = %kill_err, "failed to kill collection");
                    }
                    self.active.remove(&name);
                    self.fail(i, &e)?;
                    changed = true;
                    continue;
                }
            };
            if !finished {
                continue;
            }
            debug!(calibration = %name, total = summary.total, failed = summary.failed, "collection finished");
            let Some(active) = self.active.remove(&name) else {
                continue;
            };
            match active.run.manifest(&active.collection) {
                Ok(manifest) => {
                    self.set_state(i, CalibrationState::Running)?;
                    self.run_algorithms(i, &manifest.files())?;
                }
                Err(e) => self.fail(i, &e)?,
            }
            changed = true;
        }
        Ok(changed)
    }

    /// Runs every algorithm of calibration `i` on the collected files until
    /// the calibration converges, fails or needs a new collection.
    fn run_algorithms(&mut self, i: usize, outputs: &[PathBuf]) -> Result<()> {
        loop {
            let iteration = self.calibrations[i].iteration();
            let algorithm_root = self.calibration_dir(i).join(iteration.to_string()).join("algorithm_output");
            let chain = self.database_chain(i);
            let deadline = self.deadline_of(i);
            let name = self.calibrations[i].name().to_string();

            let cal = &mut self.calibrations[i];
            let hint = cal.iov_to_calibrate;
            let mut results = Vec::new();
            let mut error = None;
            for runner in cal.algorithms_mut() {
                let input = AlgorithmInput {
                    calibration: name.clone(),
                    collector_outputs: outputs.to_vec(),
                    output_dir: algorithm_root.join(runner.name()),
                    database_chain: chain.clone(),
                    deadline,
                };
                match runner.execute(&input, &[], iteration, hint.as_ref()) {
                    Ok(mut r) => results.append(&mut r),
                    Err(e) => {
                        error = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = error {
                return self.fail(i, &e);
            }

            let verdict = self.calibrations[i].evaluate(results);
            if matches!(verdict, Verdict::Converged | Verdict::Iterate) {
                if let Err(e) = self.write_iteration_outputdb(i, iteration) {
                    return self.fail(i, &e);
                }
            }
            match verdict {
                Verdict::Converged => {
                    if let Err(e) = self.publish_outputdb(i, iteration) {
                        return self.fail(i, &e);
                    }
                    return self.set_state(i, CalibrationState::Done);
                }
                Verdict::Failed(reason) => {
                    return self.set_state(i, CalibrationState::Failed(reason));
                }
                Verdict::Iterate => {
                    if let Some(deadline) = deadline.filter(Deadline::is_expired) {
                        let err = CafError::Timeout {
                            calibration: name,
                            limit: deadline.limit,
                        };
                        return self.fail(i, &err);
                    }
                    self.calibrations[i].advance_iteration();
                    info!(calibration = %name, iteration = iteration + 1, "iteration requested");
                    if self.calibrations[i].recollect_on_iteration {
                        return match self.start_collection(i) {
                            Ok(()) => self.set_state(i, CalibrationState::Collecting),
                            Err(e) => self.fail(i, &e),
                        };
                    }
                    self.set_state(i, CalibrationState::Running)?;
                }
            }
        }
    }

    fn write_iteration_outputdb(&self, i: usize, iteration: u32) -> Result<()> {
        let store = PayloadStore::open(&self.iteration_outputdb(i, iteration))?;
        let Some(results) = self.calibrations[i].results(iteration) else {
            return Ok(());
        };
        for result in results {
            if !matches!(result.code, ResultCode::Ok | ResultCode::IterationNeeded) {
                continue;
            }
            let Some(iov) = result.iov else {
                continue;
            };
            for (name, bytes) in &result.payloads {
                store.commit(name, iov, bytes)?;
            }
        }
        Ok(())
    }

    /// Copies the converged iteration's payloads into `<cal>/outputdb`.
    fn publish_outputdb(&self, i: usize, iteration: u32) -> Result<()> {
        let source = PayloadStore::open_existing(&self.iteration_outputdb(i, iteration))?;
        let target = PayloadStore::open(&self.calibration_dir(i).join(OUTPUTDB_DIR))?;
        target.merge_from(&source)?;
        Ok(())
    }

    fn enforce_timeouts(&mut self, order: &[usize]) -> Result<bool> {
        let mut changed = false;
        for &i in order {
            if *self.calibrations[i].state() != CalibrationState::Collecting {
                continue;
            }
            let Some(deadline) = self.deadline_of(i) else {
                continue;
            };
            if !deadline.is_expired() {
                continue;
            }
            let name = self.calibrations[i].name().to_string();
            if let Some(mut active) = self.active.remove(&name) {
                if let Err(e) = self.backend.kill(&mut active.collection) {
                    warn!(calibration = %name, error = %e, "failed to kill timed out collection");
                }
            }
            let err = CafError::Timeout {
                calibration: name,
                limit: deadline.limit,
            };
            self.fail(i, &err)?;
            changed = true;
        }
        Ok(changed)
    }

    /// Single-writer commit of every done calibration into `<root>/database`,
    /// in dependency order.
    fn commit_results(&self, order: &[usize]) -> Result<HashMap<String, Vec<CommittedPayload>>> {
        let store = PayloadStore::open(&self.root.join(DATABASE_DIR))?;
        let mut committed: HashMap<String, Vec<CommittedPayload>> = HashMap::new();
        for &i in order {
            let cal = &self.calibrations[i];
            if *cal.state() != CalibrationState::Done {
                continue;
            }
            let Some(results) = cal.final_results() else {
                continue;
            };
            let entries = committed.entry(cal.name().to_string()).or_default();
            for result in results.iter().filter(|r| r.code == ResultCode::Ok) {
                let Some(iov) = result.iov else {
                    continue;
                };
                for (name, bytes) in &result.payloads {
                    let outcome = store.commit(name, iov, bytes)?;
                    entries.push(CommittedPayload {
                        name: name.clone(),
                        revision: outcome.entry().revision,
                        iov,
                        unchanged: matches!(outcome, CommitOutcome::Unchanged(_)),
                    });
                }
            }
            info!(calibration = %cal.name(), payloads = entries.len(), "committed calibration results");
        }
        Ok(committed)
    }

    /// Root of the run once `run()` has started.
    pub fn output_root(&self) -> &Path {
        &self.root
    }
}
