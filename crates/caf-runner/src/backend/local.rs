use super::{find_on_path, write_submit_script, Backend, STDERR_FILE, STDOUT_FILE, SUBMIT_SCRIPT};
use crate::error::{CafError, Result};
use crate::job::{Job, JobStatus};
use std::collections::BTreeMap;
use std::fs::File;
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

/// Runs subjobs as `bash submit.sh` child processes on this machine.
///
/// At most `max_processes` children run at once. Subjobs submitted beyond the
/// cap stay `Submitted` and are started by later polls.
#[derive(Debug)]
pub struct LocalBackend {
    max_processes: usize,
    running: BTreeMap<String, Child>,
}

impl LocalBackend {
    pub fn new(max_processes: usize) -> Result<Self> {
        if max_processes == 0 {
            return Err(CafError::InvalidConfig(
                "local backend needs max_processes >= 1".to_string(),
            ));
        }
        Ok(Self {
            max_processes,
            running: BTreeMap::new(),
        })
    }

    pub fn max_processes(&self) -> usize {
        self.max_processes
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    fn spawn(&mut self, job: &mut Job) -> Result<()> {
        let stdout = File::create(job.working_dir.join(STDOUT_FILE))?;
        let stderr = File::create(job.working_dir.join(STDERR_FILE))?;
        let child = Command::new("bash")
            .arg(SUBMIT_SCRIPT)
            .current_dir(&job.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()?;
        job.backend_id = Some(child.id().to_string());
        debug!(job = %job.name, pid = child.id(), "started local subjob");
        self.running.insert(job.name.clone(), child);
        job.set_status(JobStatus::Running);
        Ok(())
    }
}

impl Backend for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn check_available(&self) -> Result<()> {
        if find_on_path("bash", None).is_none() {
            return Err(CafError::BackendUnavailable {
                backend: self.kind().to_string(),
                reason: "bash not found on PATH".to_string(),
            });
        }
        Ok(())
    }

    fn submit_subjob(&mut self, job: &mut Job) -> Result<()> {
        write_submit_script(job, &[])?;
        job.set_status(JobStatus::Submitted);
        if self.running.len() < self.max_processes {
            self.spawn(job)?;
        }
        Ok(())
    }

    fn poll_subjob(&mut self, job: &mut Job) -> Result<()> {
        match job.status() {
            JobStatus::Submitted => {
                if self.running.len() < self.max_processes {
                    self.spawn(job)?;
                }
                Ok(())
            }
            JobStatus::Running => {
                let Some(child) = self.running.get_mut(&job.name) else {
                    warn!(job = %job.name, "running subjob has no tracked process");
                    job.set_status(JobStatus::Failed);
                    return Ok(());
                };
                if let Some(status) = child.try_wait()? {
                    self.running.remove(&job.name);
                    job.exit_code = status.code();
                    let outcome = if status.success() {
                        JobStatus::Done
                    } else {
                        JobStatus::Failed
                    };
                    info!(job = %job.name, exit_code = ?status.code(), status = %outcome, "local subjob finished");
                    job.set_status(outcome);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn kill_subjob(&mut self, job: &mut Job) -> Result<()> {
        if let Some(mut child) = self.running.remove(&job.name) {
            child.kill()?;
            let _ = child.wait();
        }
        job.set_status(JobStatus::Failed);
        Ok(())
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        for (name, mut child) in std::mem::take(&mut self.running) {
            if let Ok(None) = child.try_wait() {
                warn!(job = %name, "killing local subjob left running");
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SubjobSplit;
    use caf_core::ensure_dir;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::thread;
    use std::time::{Duration, Instant};

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "caf_local_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    fn wait_until_finished(backend: &mut LocalBackend, collection: &mut crate::job::Collection) {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let (finished, _) = backend.is_job_finished(collection).expect("poll");
            if finished {
                return;
            }
            assert!(Instant::now() < deadline, "local jobs did not finish");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn local_backend_runs_subjobs_with_process_cap() {
        let root = temp_root("cap");
        let mut job = Job::new(
            "cal_Collector_Iteration_0",
            vec![
                "bash".to_string(),
                "-c".to_string(),
                "cat input_data_files.json > out.json".to_string(),
            ],
        );
        job.working_dir = root.join("work");
        job.output_dir = root.join("out");
        job.output_patterns = vec!["out.json".to_string()];
        job.input_files = vec!["a.root".into(), "b.root".into(), "c.root".into()];
        job.max_files_per_subjob = SubjobSplit::max_files(1).expect("split");

        let mut backend = LocalBackend::new(1).expect("backend");
        let mut collection = backend.submit(job).expect("submit");
        assert_eq!(collection.subjobs.len(), 3);
        assert!(backend.running_count() <= 1);
        assert_eq!(collection.subjobs[0].status(), JobStatus::Running);
        assert_eq!(collection.subjobs[1].status(), JobStatus::Submitted);

        wait_until_finished(&mut backend, &mut collection);
        let summary = collection.exit_summary();
        assert!(summary.is_success(), "{:?}", summary);
        let out = std::fs::read_to_string(root.join("out").join("2").join("out.json")).expect("output");
        assert!(out.contains("c.root"));
        assert!(root.join("work").join("0").join(".exit_code").exists());
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn failing_command_marks_subjob_failed() {
        let root = temp_root("fail");
        let mut job = Job::new("j", vec!["bash".to_string(), "-c".to_string(), "exit 3".to_string()]);
        job.working_dir = root.join("work");
        job.output_dir = root.join("out");
        let mut backend = LocalBackend::new(2).expect("backend");
        let mut collection = backend.submit(job).expect("submit");
        wait_until_finished(&mut backend, &mut collection);
        assert_eq!(collection.subjobs[0].status(), JobStatus::Failed);
        assert_eq!(collection.subjobs[0].exit_code, Some(3));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn kill_terminates_running_subjobs() {
        let root = temp_root("kill");
        let mut job = Job::new("j", vec!["sleep".to_string(), "30".to_string()]);
        job.working_dir = root.join("work");
        job.output_dir = root.join("out");
        let mut backend = LocalBackend::new(1).expect("backend");
        let mut collection = backend.submit(job).expect("submit");
        backend.kill(&mut collection).expect("kill");
        assert_eq!(collection.status(), JobStatus::Failed);
        assert_eq!(backend.running_count(), 0);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn zero_processes_is_rejected() {
        assert!(LocalBackend::new(0).is_err());
    }
}
