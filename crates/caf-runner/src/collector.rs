//! Collector passes: building the collector job for one iteration and
//! gathering what its subjobs produced.

use crate::error::{CafError, Result};
use crate::job::{BackendArgs, Collection, Job, SubjobSplit};
use caf_core::{atomic_write_json_pretty, ensure_dir};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const COLLECTOR_CONFIG_FILE: &str = "collector_config.json";
pub const COLLECTOR_MANIFEST_FILE: &str = "collector_manifest.json";

fn default_output_file() -> String {
    "CollectorOutput.root".to_string()
}

/// What a calibration runs over its input data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorSpec {
    pub command: Vec<String>,
    #[serde(default)]
    pub max_files_per_subjob: SubjobSplit,
    /// File (or glob) every successful subjob must leave behind.
    #[serde(default = "default_output_file")]
    pub output_file: String,
    #[serde(default)]
    pub output_patterns: Vec<String>,
    #[serde(default)]
    pub sandbox_files: Vec<PathBuf>,
    #[serde(default)]
    pub setup_cmds: Vec<String>,
    #[serde(default)]
    pub backend_args: BackendArgs,
}

impl CollectorSpec {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            max_files_per_subjob: SubjobSplit::Unsplit,
            output_file: default_output_file(),
            output_patterns: Vec::new(),
            sandbox_files: Vec::new(),
            setup_cmds: Vec::new(),
            backend_args: BackendArgs::default(),
        }
    }

    pub fn with_max_files_per_subjob(mut self, split: SubjobSplit) -> Self {
        self.max_files_per_subjob = split;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(CafError::InvalidConfig("collector command must not be empty".to_string()));
        }
        if self.output_file.trim().is_empty() {
            return Err(CafError::InvalidConfig("collector output_file must not be empty".to_string()));
        }
        for pattern in std::iter::once(&self.output_file).chain(&self.output_patterns) {
            glob::Pattern::new(pattern).map_err(|e| {
                CafError::InvalidConfig(format!("invalid collector output pattern '{}': {}", pattern, e))
            })?;
        }
        Ok(())
    }

    fn patterns(&self) -> Result<Vec<glob::Pattern>> {
        std::iter::once(&self.output_file)
            .chain(&self.output_patterns)
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| CafError::InvalidConfig(format!("invalid output pattern '{}': {}", p, e)))
            })
            .collect()
    }
}

/// Name of the collector job of `calibration` for `iteration`.
pub fn collector_job_name(calibration: &str, iteration: u32) -> String {
    format!("{}_Collector_Iteration_{}", calibration, iteration)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjobOutputs {
    pub subjob: String,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectorManifest {
    pub job: String,
    pub subjobs: Vec<SubjobOutputs>,
}

impl CollectorManifest {
    pub fn files(&self) -> Vec<PathBuf> {
        self.subjobs.iter().flat_map(|s| s.files.iter().cloned()).collect()
    }
}

/// One collector pass of a calibration.
#[derive(Debug, Clone)]
pub struct CollectorRun {
    pub calibration: String,
    pub iteration: u32,
    pub iteration_dir: PathBuf,
    spec: CollectorSpec,
}

impl CollectorRun {
    /// Writes the collector configuration for `iteration` under
    /// `<calibration_dir>/<iteration>/` and returns the job to submit.
    pub fn prepare(
        spec: &CollectorSpec,
        calibration: &str,
        calibration_dir: &Path,
        iteration: u32,
        input_files: &[String],
        backend_args: &BackendArgs,
        database_chain: &[PathBuf],
    ) -> Result<(Self, Job)> {
        spec.validate()?;
        let iteration_dir = calibration_dir.join(iteration.to_string());
        let input_dir = iteration_dir.join("collector_input");
        let output_dir = iteration_dir.join("collector_output");
        ensure_dir(&input_dir)?;

        let config_path = input_dir.join(COLLECTOR_CONFIG_FILE);
        atomic_write_json_pretty(
            &config_path,
            &json!({
                "calibration": calibration,
                "iteration": iteration,
                "database_chain": database_chain,
                "output_file": spec.output_file,
            }),
        )?;

        let mut job = Job::new(collector_job_name(calibration, iteration), spec.command.clone());
        job.working_dir = output_dir.clone();
        job.output_dir = output_dir;
        job.input_files = input_files.to_vec();
        job.input_sandbox_files = spec.sandbox_files.clone();
        job.input_sandbox_files.push(config_path);
        job.output_patterns = std::iter::once(spec.output_file.clone())
            .chain(spec.output_patterns.iter().cloned())
            .collect();
        job.setup_cmds = spec.setup_cmds.clone();
        job.backend_args = spec.backend_args.merged_over(backend_args);
        job.max_files_per_subjob = spec.max_files_per_subjob;
        job.env.insert("CAF_INPUT_DATA".to_string(), crate::backend::INPUT_DATA_FILE.to_string());
        job.env.insert("CAF_COLLECTOR_CONFIG".to_string(), COLLECTOR_CONFIG_FILE.to_string());
        job.env.insert("CAF_OUTPUT_DIR".to_string(), ".".to_string());
        job.env.insert("CAF_ITERATION".to_string(), iteration.to_string());

        info!(calibration, iteration, job = %job.name, files = input_files.len(), "prepared collector job");
        Ok((
            Self {
                calibration: calibration.to_string(),
                iteration,
                iteration_dir,
                spec: spec.clone(),
            },
            job,
        ))
    }

    /// Gathers the outputs of a finished collection and writes
    /// `collector_manifest.json`.
    ///
    /// Fails when any subjob failed or a successful subjob left no output file.
    pub fn manifest(&self, collection: &Collection) -> Result<CollectorManifest> {
        let summary = collection.exit_summary();
        if !summary.is_success() {
            return Err(CafError::CollectionFailed {
                job: collection.name.clone(),
                reason: format!(
                    "{} of {} subjobs failed ({})",
                    summary.failed,
                    summary.total,
                    summary.failed_jobs.join(", ")
                ),
            });
        }
        let patterns = self.spec.patterns()?;
        let mut manifest = CollectorManifest {
            job: collection.name.clone(),
            subjobs: Vec::with_capacity(collection.subjobs.len()),
        };
        for subjob in &collection.subjobs {
            let mut files = Vec::new();
            let mut has_primary = false;
            let entries = match fs::read_dir(&subjob.output_dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(job = %subjob.name, error = %e, "cannot list subjob output directory");
                    return Err(CafError::CollectionFailed {
                        job: collection.name.clone(),
                        reason: format!("subjob {} has no readable output directory", subjob.name),
                    });
                }
            };
            for entry in entries {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if patterns[0].matches(&name) {
                    has_primary = true;
                }
                if patterns.iter().any(|p| p.matches(&name)) {
                    files.push(entry.path());
                }
            }
            if !has_primary {
                return Err(CafError::CollectionFailed {
                    job: collection.name.clone(),
                    reason: format!(
                        "subjob {} finished without producing {}",
                        subjob.name, self.spec.output_file
                    ),
                });
            }
            files.sort();
            manifest.subjobs.push(SubjobOutputs {
                subjob: subjob.name.clone(),
                files,
            });
        }
        atomic_write_json_pretty(
            &self.iteration_dir.join(COLLECTOR_MANIFEST_FILE),
            &serde_json::to_value(&manifest)?,
        )?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, InMemoryBackend, SimulatedOutcome};
    use crate::job::JobStatus;
    use chrono::Utc;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "caf_collector_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    fn spec() -> CollectorSpec {
        CollectorSpec::new(vec!["collect".to_string()])
            .with_max_files_per_subjob(SubjobSplit::max_files(1).expect("split"))
    }

    fn inputs() -> Vec<String> {
        vec!["a.root".into(), "b.root".into(), "c.root".into()]
    }

    #[test]
    fn prepare_builds_named_job_with_config_and_env() {
        let root = temp_root("prepare");
        let chain = vec![root.join("Dep").join("outputdb")];
        let (run, job) = CollectorRun::prepare(
            &spec(),
            "InitStage",
            &root.join("InitStage"),
            0,
            &inputs(),
            &BackendArgs::default(),
            &chain,
        )
        .expect("prepare");
        assert_eq!(job.name, "InitStage_Collector_Iteration_0");
        assert_eq!(job.working_dir, root.join("InitStage").join("0").join("collector_output"));
        assert_eq!(job.env.get("CAF_ITERATION").map(String::as_str), Some("0"));
        assert_eq!(job.output_patterns, vec!["CollectorOutput.root".to_string()]);
        let config_path = run.iteration_dir.join("collector_input").join(COLLECTOR_CONFIG_FILE);
        assert!(job.input_sandbox_files.contains(&config_path));
        let config: serde_json::Value =
            serde_json::from_slice(&fs::read(&config_path).expect("config")).expect("json");
        assert_eq!(config["calibration"], "InitStage");
        assert_eq!(config["database_chain"].as_array().map(|a| a.len()), Some(1));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn manifest_lists_outputs_per_subjob() {
        let root = temp_root("manifest");
        let (run, job) = CollectorRun::prepare(
            &spec(),
            "Cal",
            &root.join("Cal"),
            0,
            &inputs(),
            &BackendArgs::default(),
            &[],
        )
        .expect("prepare");
        let mut backend = InMemoryBackend::default();
        let mut collection = backend.submit(job).expect("submit");
        let (finished, _) = backend.is_job_finished(&mut collection).expect("poll");
        assert!(finished);
        let manifest = run.manifest(&collection).expect("manifest");
        assert_eq!(manifest.subjobs.len(), 3);
        assert_eq!(manifest.files().len(), 3);
        assert!(run.iteration_dir.join(COLLECTOR_MANIFEST_FILE).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn manifest_rejects_failed_or_empty_subjobs() {
        let root = temp_root("partial");
        let (run, job) = CollectorRun::prepare(
            &spec(),
            "Cal",
            &root.join("Cal"),
            0,
            &inputs(),
            &BackendArgs::default(),
            &[],
        )
        .expect("prepare");
        let mut backend = InMemoryBackend::new(Box::new(|job: &Job| {
            if job.name.ends_with("_2") {
                SimulatedOutcome::failure_after(0)
            } else {
                SimulatedOutcome::success_after(0)
            }
        }));
        let mut collection = backend.submit(job).expect("submit");
        backend.is_job_finished(&mut collection).expect("poll");
        let err = run.manifest(&collection).expect_err("failed subjob");
        assert!(matches!(err, CafError::CollectionFailed { .. }));

        // All subjobs done but one produced nothing.
        let mut collection = collection.clone();
        let last = collection.subjobs.len() - 1;
        let mut fresh = Job::new("x", vec!["x".to_string()]);
        fresh.set_status(JobStatus::Done);
        fresh.output_dir = root.join("empty");
        ensure_dir(&fresh.output_dir).expect("empty dir");
        collection.subjobs[last] = fresh;
        let err = run.manifest(&collection).expect_err("missing output");
        assert!(err.to_string().contains("without producing"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn spec_rejects_empty_command_and_bad_patterns() {
        assert!(CollectorSpec::new(vec![]).validate().is_err());
        let mut bad = spec();
        bad.output_patterns = vec!["[".to_string()];
        assert!(bad.validate().is_err());
        let parsed: CollectorSpec =
            serde_yaml::from_str("command: [collect]\nmax_files_per_subjob: -1\n").expect("parse");
        assert_eq!(parsed.max_files_per_subjob, SubjobSplit::Unsplit);
        assert_eq!(parsed.output_file, "CollectorOutput.root");
    }
}
