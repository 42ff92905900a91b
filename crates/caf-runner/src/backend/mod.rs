//! Execution backends.
//!
//! A backend turns a [`Job`] into a [`Collection`] of subjobs and tracks them
//! until every subjob is terminal. Implementations provide the per-subjob
//! primitives; submission, polling and killing of whole collections are shared.

pub mod batch;
pub mod local;
pub mod memory;

pub use batch::{BatchBackend, BatchSystem};
pub use local::LocalBackend;
pub use memory::{InMemoryBackend, SimulatedOutcome, SimulationPolicy, SubmissionLog, SubmissionRecord};

use crate::error::{CafError, Result};
use crate::job::{BackendArgs, Collection, ExitSummary, Job, JobStatus, SubjobSplit};
use caf_core::{atomic_write_bytes, ensure_dir};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SUBMIT_SCRIPT: &str = "submit.sh";
pub const INPUT_DATA_FILE: &str = "input_data_files.json";
pub const EXIT_CODE_FILE: &str = ".exit_code";
pub const STDOUT_FILE: &str = "stdout";
pub const STDERR_FILE: &str = "stderr";

pub trait Backend {
    /// Short name used in logs and errors.
    fn kind(&self) -> &'static str;

    /// Errors with [`CafError::BackendUnavailable`] when jobs cannot be run.
    fn check_available(&self) -> Result<()>;

    /// Hands a prepared subjob (directories, sandbox and script in place) to
    /// the execution system. Must not block on completion.
    fn submit_subjob(&mut self, job: &mut Job) -> Result<()>;

    /// Refreshes the status of a non-terminal subjob.
    fn poll_subjob(&mut self, job: &mut Job) -> Result<()>;

    fn kill_subjob(&mut self, job: &mut Job) -> Result<()>;

    fn submit(&mut self, job: Job) -> Result<Collection> {
        self.check_available()?;
        let mut collection = Collection::from_job(job);
        for subjob in &collection.subjobs {
            ensure_dir(&subjob.working_dir)?;
            ensure_dir(&subjob.output_dir)?;
        }
        for k in 0..collection.subjobs.len() {
            let subjob = &mut collection.subjobs[k];
            let result = stage_input_sandbox(subjob).and_then(|()| write_input_data(subjob));
            if let Err(err) = result.and_then(|()| self.submit_subjob(subjob)) {
                warn!(job = %collection.subjobs[k].name, error = %err, "submission failed, killing submitted subjobs");
                for submitted in collection.subjobs[..k].iter_mut() {
                    if let Err(e) = self.kill_subjob(submitted) {
                        warn!(job = %submitted.name, error = %e, "failed to kill subjob");
                    }
                    submitted.set_status(JobStatus::Failed);
                }
                return Err(err);
            }
        }
        info!(
            backend = self.kind(),
            job = %collection.name,
            subjobs = collection.subjobs.len(),
            "submitted collection"
        );
        Ok(collection)
    }

    fn submit_all(&mut self, jobs: Vec<Job>) -> Result<Vec<Collection>> {
        jobs.into_iter().map(|job| self.submit(job)).collect()
    }

    /// Non-blocking poll. Finished means every subjob is terminal.
    fn is_job_finished(&mut self, collection: &mut Collection) -> Result<(bool, ExitSummary)> {
        for subjob in collection.subjobs.iter_mut() {
            if subjob.status().is_terminal() {
                continue;
            }
            self.poll_subjob(subjob)?;
            if subjob.status() == JobStatus::Done {
                collect_output(subjob)?;
            }
        }
        Ok((collection.is_finished(), collection.exit_summary()))
    }

    /// Best-effort termination of every unfinished subjob.
    fn kill(&mut self, collection: &mut Collection) -> Result<()> {
        for subjob in collection.subjobs.iter_mut() {
            if subjob.status().is_terminal() {
                continue;
            }
            if let Err(e) = self.kill_subjob(subjob) {
                warn!(job = %subjob.name, error = %e, "failed to kill subjob");
            }
            subjob.set_status(JobStatus::Failed);
        }
        info!(backend = self.kind(), job = %collection.name, "killed collection");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Pbs,
    Lsf,
}

fn default_max_processes() -> usize {
    4
}

/// The `backend` section of a configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub kind: BackendKind,
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,
    #[serde(default)]
    pub queue: Option<String>,
    /// Split applied to collectors that do not set their own.
    #[serde(default)]
    pub max_files_per_subjob: Option<SubjobSplit>,
    #[serde(default)]
    pub backend_args: BackendArgs,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Local,
            max_processes: default_max_processes(),
            queue: None,
            max_files_per_subjob: None,
            backend_args: BackendArgs::default(),
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.kind == BackendKind::Local && self.max_processes == 0 {
            return Err(CafError::InvalidConfig(
                "backend.max_processes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Scheduler arguments applied to every job unless a calibration overrides them.
    pub fn default_args(&self) -> BackendArgs {
        let mut args = self.backend_args.clone();
        if self.queue.is_some() {
            args.queue = self.queue.clone();
        }
        args
    }

    pub fn build(&self) -> Result<Box<dyn Backend>> {
        self.validate()?;
        Ok(match self.kind {
            BackendKind::Local => Box::new(LocalBackend::new(self.max_processes)?),
            BackendKind::Pbs => Box::new(BatchBackend::new(BatchSystem::Pbs)),
            BackendKind::Lsf => Box::new(BatchBackend::new(BatchSystem::Lsf)),
        })
    }
}

/// Looks `binary` up in `search_path` (or `PATH` when `None`).
pub fn find_on_path(binary: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    let path_var = match search_path {
        Some(p) => p.to_os_string(),
        None => std::env::var_os("PATH")?,
    };
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

fn stage_input_sandbox(job: &Job) -> Result<()> {
    for src in &job.input_sandbox_files {
        let name = src.file_name().ok_or_else(|| {
            CafError::InvalidConfig(format!("sandbox path {} has no file name", src.display()))
        })?;
        let dst = job.working_dir.join(name);
        if src.is_dir() {
            copy_dir(src, &dst)?;
        } else {
            fs::copy(src, &dst).map_err(|e| {
                CafError::Other(anyhow::anyhow!(
                    "failed to copy sandbox file {} into {}: {}",
                    src.display(),
                    job.working_dir.display(),
                    e
                ))
            })?;
        }
    }
    Ok(())
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| CafError::Other(e.into()))?;
        let rel = entry.path().strip_prefix(src).map_err(|e| CafError::Other(e.into()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn write_input_data(job: &Job) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(&json!(job.input_files))?;
    atomic_write_bytes(&job.working_dir.join(INPUT_DATA_FILE), &bytes)?;
    Ok(())
}

/// Moves files matching the job's output patterns from its working directory
/// to its output directory.
fn collect_output(job: &Job) -> Result<()> {
    if job.working_dir == job.output_dir || job.output_patterns.is_empty() {
        return Ok(());
    }
    for pattern in &job.output_patterns {
        let full = job.working_dir.join(pattern);
        let Some(full) = full.to_str() else {
            warn!(job = %job.name, pattern = %pattern, "skipping non UTF-8 output pattern");
            continue;
        };
        let matches = glob::glob(full).map_err(|e| {
            CafError::InvalidConfig(format!("invalid output pattern '{}': {}", pattern, e))
        })?;
        for path in matches.flatten() {
            let Some(name) = path.file_name() else {
                continue;
            };
            let target = job.output_dir.join(name);
            debug!(job = %job.name, from = %path.display(), to = %target.display(), "moving output");
            if fs::rename(&path, &target).is_err() {
                fs::copy(&path, &target)?;
                fs::remove_file(&path)?;
            }
        }
    }
    Ok(())
}

/// Writes `submit.sh` into the job's working directory.
///
/// The script runs the setup commands, exports the job environment, runs the
/// command and records its exit code in [`EXIT_CODE_FILE`].
pub fn write_submit_script(job: &Job, directives: &[String]) -> Result<PathBuf> {
    if job.cmd.is_empty() {
        return Err(CafError::InvalidConfig(format!("job {} has an empty command", job.name)));
    }
    let mut lines = vec!["#!/bin/bash".to_string()];
    lines.extend(directives.iter().cloned());
    lines.push(format!("cd {}", shell_quote(&job.working_dir.to_string_lossy())));
    lines.extend(job.setup_cmds.iter().cloned());
    for (key, value) in &job.env {
        lines.push(format!("export {}={}", key, shell_quote(value)));
    }
    lines.push(shell_join(&job.cmd));
    lines.push("caf_exit_code=$?".to_string());
    lines.push(format!("echo \"$caf_exit_code\" > {}", EXIT_CODE_FILE));
    lines.push("exit \"$caf_exit_code\"".to_string());
    let mut body = lines.join("\n");
    body.push('\n');

    let path = job.working_dir.join(SUBMIT_SCRIPT);
    atomic_write_bytes(&path, body.as_bytes())?;
    Ok(path)
}

/// Exit code recorded by the submit script, if the job got that far.
pub fn read_exit_code(job: &Job) -> Option<i32> {
    fs::read_to_string(job.working_dir.join(EXIT_CODE_FILE))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

pub(crate) fn shell_join(parts: &[String]) -> String {
    parts.iter().map(|p| shell_quote(p)).collect::<Vec<_>>().join(" ")
}

pub(crate) fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c)) {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
