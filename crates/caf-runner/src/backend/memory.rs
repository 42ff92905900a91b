use super::Backend;
use crate::error::{CafError, Result};
use crate::job::{Job, JobStatus};
use caf_core::atomic_write_bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// How a simulated subjob behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedOutcome {
    /// Polls reporting `Running` before the subjob finishes.
    pub polls_until_done: u32,
    pub succeed: bool,
}

impl SimulatedOutcome {
    pub fn success_after(polls: u32) -> Self {
        Self {
            polls_until_done: polls,
            succeed: true,
        }
    }

    pub fn failure_after(polls: u32) -> Self {
        Self {
            polls_until_done: polls,
            succeed: false,
        }
    }
}

/// Decides the outcome of each subjob at submission time.
pub type SimulationPolicy = Box<dyn FnMut(&Job) -> SimulatedOutcome + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub sequence: u64,
    pub job: String,
    pub input_files: Vec<String>,
}

/// Shared view of the submissions made to an [`InMemoryBackend`], usable
/// after the backend itself has been handed to a driver.
#[derive(Debug, Clone, Default)]
pub struct SubmissionLog(Arc<Mutex<Vec<SubmissionRecord>>>);

impl SubmissionLog {
    pub fn records(&self) -> Vec<SubmissionRecord> {
        self.0.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Submissions whose subjob name starts with `prefix`.
    pub fn for_prefix(&self, prefix: &str) -> Vec<SubmissionRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.job.starts_with(prefix))
            .collect()
    }

    fn push(&self, record: SubmissionRecord) {
        if let Ok(mut records) = self.0.lock() {
            records.push(record);
        }
    }
}

/// Deterministic backend that never spawns processes.
///
/// Successful subjobs get every literal (non-glob) output pattern written
/// into their output directory, containing their input file list.
pub struct InMemoryBackend {
    policy: SimulationPolicy,
    unavailable: Option<String>,
    pending: HashMap<String, SimulatedOutcome>,
    log: SubmissionLog,
    sequence: u64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(Box::new(|_| SimulatedOutcome::success_after(0)))
    }
}

impl InMemoryBackend {
    pub fn new(policy: SimulationPolicy) -> Self {
        Self {
            policy,
            unavailable: None,
            pending: HashMap::new(),
            log: SubmissionLog::default(),
            sequence: 0,
        }
    }

    /// A backend whose availability check always fails with `reason`.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        let mut backend = Self::default();
        backend.unavailable = Some(reason.into());
        backend
    }

    pub fn submission_log(&self) -> SubmissionLog {
        self.log.clone()
    }

    fn write_outputs(job: &Job) -> Result<()> {
        let body = job.input_files.join("\n");
        for pattern in &job.output_patterns {
            if pattern.contains(&['*', '?', '['][..]) {
                continue;
            }
            atomic_write_bytes(&job.output_dir.join(pattern), body.as_bytes())?;
        }
        Ok(())
    }
}

impl Backend for InMemoryBackend {
    fn kind(&self) -> &'static str {
        "in_memory"
    }

    fn check_available(&self) -> Result<()> {
        match &self.unavailable {
            Some(reason) => Err(CafError::BackendUnavailable {
                backend: self.kind().to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn submit_subjob(&mut self, job: &mut Job) -> Result<()> {
        let outcome = (self.policy)(job);
        self.sequence += 1;
        self.log.push(SubmissionRecord {
            sequence: self.sequence,
            job: job.name.clone(),
            input_files: job.input_files.clone(),
        });
        self.pending.insert(job.name.clone(), outcome);
        job.backend_id = Some(format!("mem-{}", self.sequence));
        job.set_status(JobStatus::Submitted);
        debug!(job = %job.name, ?outcome, "simulated submission");
        Ok(())
    }

    fn poll_subjob(&mut self, job: &mut Job) -> Result<()> {
        let Some(outcome) = self.pending.get_mut(&job.name) else {
            job.set_status(JobStatus::Failed);
            return Ok(());
        };
        if outcome.polls_until_done > 0 {
            outcome.polls_until_done -= 1;
            job.set_status(JobStatus::Running);
            return Ok(());
        }
        let succeed = outcome.succeed;
        self.pending.remove(&job.name);
        if succeed {
            Self::write_outputs(job)?;
            job.exit_code = Some(0);
            job.set_status(JobStatus::Done);
        } else {
            job.exit_code = Some(1);
            job.set_status(JobStatus::Failed);
        }
        Ok(())
    }

    fn kill_subjob(&mut self, job: &mut Job) -> Result<()> {
        self.pending.remove(&job.name);
        job.set_status(JobStatus::Failed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SubjobSplit;
    use caf_core::ensure_dir;
    use chrono::Utc;
    use std::path::PathBuf;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "caf_memory_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    fn job(root: &PathBuf, files: usize) -> Job {
        let mut job = Job::new("sim", vec!["collect".to_string()]);
        job.working_dir = root.join("work");
        job.output_dir = root.join("out");
        job.output_patterns = vec!["CollectorOutput.root".to_string(), "*.log".to_string()];
        job.input_files = (0..files).map(|i| format!("f{}.root", i)).collect();
        job.max_files_per_subjob = SubjobSplit::max_files(1).expect("split");
        job
    }

    #[test]
    fn policy_controls_polls_and_outcome() {
        let root = temp_root("policy");
        let mut backend = InMemoryBackend::new(Box::new(|job: &Job| {
            if job.name.ends_with("_1") {
                SimulatedOutcome::failure_after(0)
            } else {
                SimulatedOutcome::success_after(2)
            }
        }));
        let log = backend.submission_log();
        let mut collection = backend.submit(job(&root, 2)).expect("submit");
        assert_eq!(log.len(), 2);

        let (finished, summary) = backend.is_job_finished(&mut collection).expect("poll 1");
        assert!(!finished);
        assert_eq!(summary.failed, 1);
        assert_eq!(collection.subjobs[0].status(), JobStatus::Running);
        backend.is_job_finished(&mut collection).expect("poll 2");
        let (finished, _) = backend.is_job_finished(&mut collection).expect("poll 3");
        assert!(finished);
        let out = root.join("out").join("0").join("CollectorOutput.root");
        assert_eq!(std::fs::read_to_string(out).expect("output"), "f0.root");
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn unavailable_backend_submits_nothing() {
        let root = temp_root("unavailable");
        let mut backend = InMemoryBackend::unavailable("maintenance");
        let log = backend.submission_log();
        let err = backend.submit(job(&root, 3)).expect_err("must fail");
        assert!(matches!(err, CafError::BackendUnavailable { .. }));
        assert!(log.is_empty());
        assert!(!root.join("work").exists());
        let _ = std::fs::remove_dir_all(root);
    }
}
