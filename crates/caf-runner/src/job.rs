//! Jobs, subjob splitting and collections.

use crate::error::{CafError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotSubmitted,
    Submitted,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::NotSubmitted => "not_submitted",
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a job's input files are spread over subjobs.
///
/// In configuration files this is an integer: `-1` keeps every file in one
/// subjob, `n >= 1` caps the files per subjob. `0` is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum SubjobSplit {
    #[default]
    Unsplit,
    MaxFiles(NonZeroUsize),
}

impl SubjobSplit {
    pub fn max_files(n: usize) -> Result<Self> {
        NonZeroUsize::new(n)
            .map(SubjobSplit::MaxFiles)
            .ok_or_else(|| CafError::InvalidConfig("max_files_per_subjob must not be 0".to_string()))
    }
}

impl TryFrom<i64> for SubjobSplit {
    type Error = CafError;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            -1 => Ok(SubjobSplit::Unsplit),
            n if n >= 1 => usize::try_from(n)
                .map_err(|_| CafError::InvalidConfig(format!("max_files_per_subjob {} too large", n)))
                .and_then(SubjobSplit::max_files),
            n => Err(CafError::InvalidConfig(format!(
                "max_files_per_subjob must be -1 (unsplit) or >= 1, got {}",
                n
            ))),
        }
    }
}

impl From<SubjobSplit> for i64 {
    fn from(split: SubjobSplit) -> Self {
        match split {
            SubjobSplit::Unsplit => -1,
            SubjobSplit::MaxFiles(n) => n.get() as i64,
        }
    }
}

/// Scheduler options: a queue plus free-form pass-through settings.
///
/// Serialized as a flat string map where the `queue` key is lifted out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct BackendArgs {
    pub queue: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl BackendArgs {
    /// `self` with any unset field taken from `fallback`.
    pub fn merged_over(&self, fallback: &BackendArgs) -> BackendArgs {
        let mut extra = fallback.extra.clone();
        extra.extend(self.extra.clone());
        BackendArgs {
            queue: self.queue.clone().or_else(|| fallback.queue.clone()),
            extra,
        }
    }
}

impl From<BTreeMap<String, String>> for BackendArgs {
    fn from(mut map: BTreeMap<String, String>) -> Self {
        let queue = map.remove("queue");
        Self { queue, extra: map }
    }
}

impl From<BackendArgs> for BTreeMap<String, String> {
    fn from(args: BackendArgs) -> Self {
        let mut map = args.extra;
        if let Some(queue) = args.queue {
            map.insert("queue".to_string(), queue);
        }
        map
    }
}

/// One unit of batch work.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub cmd: Vec<String>,
    pub working_dir: PathBuf,
    pub output_dir: PathBuf,
    pub input_files: Vec<String>,
    pub input_sandbox_files: Vec<PathBuf>,
    pub output_patterns: Vec<String>,
    pub setup_cmds: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub backend_args: BackendArgs,
    pub max_files_per_subjob: SubjobSplit,
    /// Process id or scheduler job id once submitted.
    pub backend_id: Option<String>,
    pub exit_code: Option<i32>,
    status: JobStatus,
}

impl Job {
    pub fn new(name: impl Into<String>, cmd: Vec<String>) -> Self {
        Self {
            name: name.into(),
            cmd,
            working_dir: PathBuf::from("."),
            output_dir: PathBuf::from("."),
            input_files: Vec::new(),
            input_sandbox_files: Vec::new(),
            output_patterns: Vec::new(),
            setup_cmds: Vec::new(),
            env: BTreeMap::new(),
            backend_args: BackendArgs::default(),
            max_files_per_subjob: SubjobSplit::Unsplit,
            backend_id: None,
            exit_code: None,
            status: JobStatus::NotSubmitted,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Updates the status. Terminal statuses never change; returns whether
    /// the update was applied.
    pub fn set_status(&mut self, status: JobStatus) -> bool {
        if self.status.is_terminal() {
            if self.status != status {
                debug!(job = %self.name, current = %self.status, requested = %status, "ignoring status change of finished job");
            }
            return false;
        }
        if self.status != status {
            debug!(job = %self.name, from = %self.status, to = %status, "job status");
            self.status = status;
        }
        true
    }
}

/// Splits `files` into consecutive chunks, preserving order.
///
/// Always yields at least one chunk; an empty input or an unsplit job gives
/// exactly one.
pub fn partition_input_files(files: &[String], split: SubjobSplit) -> Vec<Vec<String>> {
    match split {
        SubjobSplit::MaxFiles(n) if !files.is_empty() => {
            files.chunks(n.get()).map(|c| c.to_vec()).collect()
        }
        _ => vec![files.to_vec()],
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExitSummary {
    pub total: usize,
    pub finished: usize,
    pub failed: usize,
    pub failed_jobs: Vec<String>,
}

impl ExitSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.finished == self.total
    }
}

/// The subjobs created from one submitted [`Job`].
#[derive(Debug, Clone)]
pub struct Collection {
    pub name: String,
    pub working_dir: PathBuf,
    pub output_dir: PathBuf,
    pub subjobs: Vec<Job>,
}

impl Collection {
    pub fn from_job(job: Job) -> Self {
        let parts = partition_input_files(&job.input_files, job.max_files_per_subjob);
        let subjobs = parts
            .into_iter()
            .enumerate()
            .map(|(i, files)| {
                let mut sub = job.clone();
                sub.name = format!("{}_{}", job.name, i);
                sub.working_dir = job.working_dir.join(i.to_string());
                sub.output_dir = job.output_dir.join(i.to_string());
                sub.input_files = files;
                sub.max_files_per_subjob = SubjobSplit::Unsplit;
                sub
            })
            .collect();
        Self {
            name: job.name,
            working_dir: job.working_dir,
            output_dir: job.output_dir,
            subjobs,
        }
    }

    /// Aggregate status: terminal once every subjob is, failed if any failed.
    pub fn status(&self) -> JobStatus {
        if self.is_finished() {
            if self.subjobs.iter().any(|j| j.status() == JobStatus::Failed) {
                JobStatus::Failed
            } else {
                JobStatus::Done
            }
        } else if self.subjobs.iter().any(|j| j.status() == JobStatus::Running) {
            JobStatus::Running
        } else if self.subjobs.iter().any(|j| j.status() != JobStatus::NotSubmitted) {
            JobStatus::Submitted
        } else {
            JobStatus::NotSubmitted
        }
    }

    pub fn is_finished(&self) -> bool {
        self.subjobs.iter().all(|j| j.status().is_terminal())
    }

    pub fn exit_summary(&self) -> ExitSummary {
        let failed_jobs: Vec<String> = self
            .subjobs
            .iter()
            .filter(|j| j.status() == JobStatus::Failed)
            .map(|j| j.name.clone())
            .collect();
        ExitSummary {
            total: self.subjobs.len(),
            finished: self.subjobs.iter().filter(|j| j.status().is_terminal()).count(),
            failed: failed_jobs.len(),
            failed_jobs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("f{}.root", i)).collect()
    }

    #[test]
    fn partition_caps_files_and_keeps_remainder_last() {
        let input = files(7);
        let parts = partition_input_files(&input, SubjobSplit::max_files(3).expect("split"));
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], vec!["f0.root", "f1.root", "f2.root"]);
        assert_eq!(parts[2], vec!["f6.root"]);
        assert_eq!(parts.concat(), input);
    }

    #[test]
    fn partition_unsplit_and_empty_yield_one_subjob() {
        let input = files(4);
        assert_eq!(partition_input_files(&input, SubjobSplit::Unsplit), vec![input.clone()]);
        let split = SubjobSplit::max_files(2).expect("split");
        assert_eq!(partition_input_files(&[], split), vec![Vec::<String>::new()]);
    }

    #[test]
    fn subjob_split_integer_encoding() {
        assert_eq!(SubjobSplit::try_from(-1).expect("unsplit"), SubjobSplit::Unsplit);
        assert_eq!(i64::from(SubjobSplit::try_from(5).expect("five")), 5);
        assert!(SubjobSplit::try_from(0).is_err());
        assert!(SubjobSplit::try_from(-3).is_err());
        let parsed: SubjobSplit = serde_json::from_str("2").expect("parse");
        assert_eq!(parsed, SubjobSplit::max_files(2).expect("two"));
        assert!(serde_json::from_str::<SubjobSplit>("0").is_err());
    }

    #[test]
    fn terminal_status_is_immutable() {
        let mut job = Job::new("j", vec!["true".to_string()]);
        assert!(job.set_status(JobStatus::Submitted));
        assert!(job.set_status(JobStatus::Running));
        assert!(job.set_status(JobStatus::Failed));
        assert!(!job.set_status(JobStatus::Done));
        assert!(!job.set_status(JobStatus::Running));
        assert_eq!(job.status(), JobStatus::Failed);
    }

    #[test]
    fn collection_names_and_places_subjobs() {
        let mut job = Job::new("Cal_Collector_Iteration_0", vec!["collect".to_string()]);
        job.working_dir = PathBuf::from("/w");
        job.output_dir = PathBuf::from("/o");
        job.input_files = files(3);
        job.max_files_per_subjob = SubjobSplit::max_files(1).expect("split");
        let collection = Collection::from_job(job);
        assert_eq!(collection.subjobs.len(), 3);
        assert_eq!(collection.subjobs[2].name, "Cal_Collector_Iteration_0_2");
        assert_eq!(collection.subjobs[2].working_dir, PathBuf::from("/w/2"));
        assert_eq!(collection.subjobs[2].output_dir, PathBuf::from("/o/2"));
        assert_eq!(collection.subjobs[1].input_files, vec!["f1.root"]);
        assert_eq!(collection.status(), JobStatus::NotSubmitted);
    }

    #[test]
    fn collection_status_and_summary_aggregate_subjobs() {
        let mut job = Job::new("c", vec!["x".to_string()]);
        job.input_files = files(2);
        job.max_files_per_subjob = SubjobSplit::max_files(1).expect("split");
        let mut collection = Collection::from_job(job);
        collection.subjobs[0].set_status(JobStatus::Running);
        collection.subjobs[1].set_status(JobStatus::Submitted);
        assert_eq!(collection.status(), JobStatus::Running);
        assert!(!collection.is_finished());

        collection.subjobs[0].set_status(JobStatus::Done);
        collection.subjobs[1].set_status(JobStatus::Failed);
        assert_eq!(collection.status(), JobStatus::Failed);
        let summary = collection.exit_summary();
        assert_eq!(summary.failed_jobs, vec!["c_1".to_string()]);
        assert!(!summary.is_success());
    }

    #[test]
    fn backend_args_lift_queue_and_merge() {
        let map: BTreeMap<String, String> = [
            ("queue".to_string(), "l".to_string()),
            ("walltime".to_string(), "01:00:00".to_string()),
        ]
        .into_iter()
        .collect();
        let args = BackendArgs::from(map);
        assert_eq!(args.queue.as_deref(), Some("l"));
        assert_eq!(args.extra.len(), 1);

        let fallback = BackendArgs {
            queue: Some("short".to_string()),
            extra: [("mem".to_string(), "2gb".to_string())].into_iter().collect(),
        };
        let merged = BackendArgs::default().merged_over(&fallback);
        assert_eq!(merged.queue.as_deref(), Some("short"));
        assert_eq!(args.merged_over(&fallback).extra.len(), 2);
    }
}
