use super::{find_on_path, read_exit_code, write_submit_script, Backend, STDERR_FILE, STDOUT_FILE};
use crate::error::{CafError, Result};
use crate::job::{Job, JobStatus};
use std::ffi::OsString;
use std::fs::File;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSystem {
    Pbs,
    Lsf,
}

/// Scheduler view of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulerState {
    Queued,
    Running,
    /// Left the scheduler; the exit code file decides success.
    Finished,
    /// Reported as failed by the scheduler itself.
    Exited,
}

impl BatchSystem {
    pub fn name(self) -> &'static str {
        match self {
            BatchSystem::Pbs => "pbs",
            BatchSystem::Lsf => "lsf",
        }
    }

    pub fn default_queue(self) -> &'static str {
        match self {
            BatchSystem::Pbs => "short",
            BatchSystem::Lsf => "s",
        }
    }

    fn submit_binary(self) -> &'static str {
        match self {
            BatchSystem::Pbs => "qsub",
            BatchSystem::Lsf => "bsub",
        }
    }

    fn status_binary(self) -> &'static str {
        match self {
            BatchSystem::Pbs => "qstat",
            BatchSystem::Lsf => "bjobs",
        }
    }

    fn kill_binary(self) -> &'static str {
        match self {
            BatchSystem::Pbs => "qdel",
            BatchSystem::Lsf => "bkill",
        }
    }

    /// Scheduler directives placed at the top of the submit script.
    pub fn directives(self, job: &Job, queue: &str) -> Vec<String> {
        let wd = job.working_dir.display();
        let stdout = job.working_dir.join(STDOUT_FILE);
        let stderr = job.working_dir.join(STDERR_FILE);
        let mut lines = match self {
            BatchSystem::Pbs => vec![
                format!("#PBS -q {}", queue),
                format!("#PBS -N {}", job.name),
                format!("#PBS -d {}", wd),
                format!("#PBS -o {}", stdout.display()),
                format!("#PBS -e {}", stderr.display()),
            ],
            BatchSystem::Lsf => vec![
                format!("#BSUB -q {}", queue),
                format!("#BSUB -J {}", job.name),
                format!("#BSUB -cwd {}", wd),
                format!("#BSUB -o {}", stdout.display()),
                format!("#BSUB -e {}", stderr.display()),
            ],
        };
        for (key, value) in &job.backend_args.extra {
            match self {
                BatchSystem::Pbs => lines.push(format!("#PBS -l {}={}", key, value)),
                BatchSystem::Lsf => lines.push(format!("#BSUB -R {}[{}]", key, value)),
            }
        }
        lines
    }

    /// Scheduler job id from the submit command's stdout.
    ///
    /// `qsub` prints the id (`1234.server`); `bsub` prints
    /// `Job <1234> is submitted to queue <s>.`.
    fn parse_job_id(self, stdout: &str) -> Option<String> {
        match self {
            BatchSystem::Pbs => stdout
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string),
            BatchSystem::Lsf => {
                let start = stdout.find("Job <")? + "Job <".len();
                let end = stdout[start..].find('>')? + start;
                Some(stdout[start..end].to_string())
            }
        }
    }

    fn interpret_status(self, output: &Output) -> SchedulerState {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        match self {
            BatchSystem::Pbs => {
                if !output.status.success() {
                    return if stderr.contains("Unknown Job Id") || stdout.contains("Unknown Job Id") {
                        SchedulerState::Finished
                    } else {
                        SchedulerState::Queued
                    };
                }
                // Header, separator, then `id name user time S queue`.
                let state = stdout
                    .lines()
                    .skip(2)
                    .find_map(|l| l.split_whitespace().nth(4).map(str::to_string));
                match state.as_deref() {
                    Some("R") | Some("E") => SchedulerState::Running,
                    Some("C") | Some("F") => SchedulerState::Finished,
                    _ => SchedulerState::Queued,
                }
            }
            BatchSystem::Lsf => {
                if stderr.contains("is not found") || stdout.contains("is not found") {
                    return SchedulerState::Finished;
                }
                // `JOBID USER STAT QUEUE ...`
                let state = stdout
                    .lines()
                    .skip(1)
                    .find_map(|l| l.split_whitespace().nth(2).map(str::to_string));
                match state.as_deref() {
                    Some("DONE") => SchedulerState::Finished,
                    Some("EXIT") => SchedulerState::Exited,
                    Some("RUN") => SchedulerState::Running,
                    _ => SchedulerState::Queued,
                }
            }
        }
    }
}

/// Submits subjobs to a PBS or LSF scheduler through its command line tools.
#[derive(Debug, Clone)]
pub struct BatchBackend {
    system: BatchSystem,
    search_path: Option<OsString>,
}

impl BatchBackend {
    pub fn new(system: BatchSystem) -> Self {
        Self {
            system,
            search_path: None,
        }
    }

    /// Resolves scheduler binaries in `path` instead of `PATH`.
    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    pub fn system(&self) -> BatchSystem {
        self.system
    }

    fn binary(&self, name: &str) -> Result<PathBuf> {
        find_on_path(name, self.search_path.as_deref()).ok_or_else(|| CafError::BackendUnavailable {
            backend: self.system.name().to_string(),
            reason: format!("{} not found on PATH", name),
        })
    }

    fn queue_for(&self, job: &Job) -> String {
        job.backend_args
            .queue
            .clone()
            .unwrap_or_else(|| self.system.default_queue().to_string())
    }
}

impl Backend for BatchBackend {
    fn kind(&self) -> &'static str {
        self.system.name()
    }

    fn check_available(&self) -> Result<()> {
        self.binary(self.system.submit_binary())?;
        self.binary(self.system.status_binary())?;
        Ok(())
    }

    fn submit_subjob(&mut self, job: &mut Job) -> Result<()> {
        let queue = self.queue_for(job);
        let script = write_submit_script(job, &self.system.directives(job, &queue))?;
        let submit = self.binary(self.system.submit_binary())?;
        let mut cmd = Command::new(submit);
        cmd.current_dir(&job.working_dir);
        match self.system {
            BatchSystem::Pbs => {
                cmd.arg(&script);
            }
            BatchSystem::Lsf => {
                cmd.stdin(Stdio::from(File::open(&script)?));
            }
        }
        let output = cmd.output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(CafError::CollectionFailed {
                job: job.name.clone(),
                reason: format!(
                    "{} exited with {:?}: {}",
                    self.system.submit_binary(),
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        let id = self.system.parse_job_id(&stdout).ok_or_else(|| CafError::CollectionFailed {
            job: job.name.clone(),
            reason: format!("could not parse scheduler job id from '{}'", stdout.trim()),
        })?;
        info!(backend = self.kind(), job = %job.name, scheduler_id = %id, queue = %queue, "submitted batch subjob");
        job.backend_id = Some(id);
        job.set_status(JobStatus::Submitted);
        Ok(())
    }

    fn poll_subjob(&mut self, job: &mut Job) -> Result<()> {
        let Some(id) = job.backend_id.clone() else {
            warn!(job = %job.name, "batch subjob has no scheduler id");
            job.set_status(JobStatus::Failed);
            return Ok(());
        };
        let status_bin = self.binary(self.system.status_binary())?;
        let output = Command::new(status_bin).arg(&id).output()?;
        let state = self.system.interpret_status(&output);
        debug!(job = %job.name, scheduler_id = %id, state = ?state, "polled batch subjob");
        match state {
            SchedulerState::Queued => {}
            SchedulerState::Running => {
                job.set_status(JobStatus::Running);
            }
            SchedulerState::Finished | SchedulerState::Exited => {
                job.exit_code = read_exit_code(job);
                let ok = state == SchedulerState::Finished && job.exit_code == Some(0);
                job.set_status(if ok { JobStatus::Done } else { JobStatus::Failed });
            }
        }
        Ok(())
    }

    fn kill_subjob(&mut self, job: &mut Job) -> Result<()> {
        if let Some(id) = &job.backend_id {
            let kill = self.binary(self.system.kill_binary())?;
            let status = Command::new(kill).arg(id).status()?;
            if !status.success() {
                warn!(job = %job.name, scheduler_id = %id, "scheduler refused kill");
            }
        }
        job.set_status(JobStatus::Failed);
        Ok(())
    }
}
