//! YAML configuration of a calibration run.
//!
//! ```yaml
//! caf:
//!   output_dir: calibration_results
//!   heartbeat_seconds: 5
//!   max_iterations: 5
//! backend:
//!   kind: local
//!   max_processes: 4
//! calibrations:
//!   - name: InitStage
//!     collector: { command: [collect.sh], max_files_per_subjob: 1 }
//!     algorithms:
//!       - { name: gain, command: [gain.py] }
//!     input_files: [data/]
//!   - name: RefineStage
//!     depends_on: [InitStage]
//!     ...
//! ```

use crate::algorithm::AlgorithmConfig;
use crate::backend::{Backend, BackendConfig};
use crate::calibration::{Calibration, DEFAULT_MAX_ITERATIONS};
use crate::collector::CollectorSpec;
use crate::driver::{Caf, DriverOptions, DEFAULT_OUTPUT_DIR};
use crate::error::{CafError, Result};
use crate::job::{BackendArgs, SubjobSplit};
use caf_core::Iov;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

fn default_output_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_DIR)
}

fn default_heartbeat_seconds() -> f64 {
    5.0
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverSection {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: f64,
    /// Default for calibrations that do not set their own.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            heartbeat_seconds: default_heartbeat_seconds(),
            max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationConfig {
    pub name: String,
    pub collector: CollectorSpec,
    pub algorithms: Vec<AlgorithmConfig>,
    /// Files, directories (walked recursively), globs or remote URLs.
    #[serde(default)]
    pub input_files: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub iov: Option<Iov>,
    #[serde(default)]
    pub payload_names: Vec<String>,
    #[serde(default)]
    pub recollect_on_iteration: bool,
    #[serde(default)]
    pub backend_args: BackendArgs,
}

impl CalibrationConfig {
    /// The configured wall-clock limit; must be positive and representable.
    pub fn timeout(&self) -> Result<Option<Duration>> {
        let Some(seconds) = self.timeout_seconds else {
            return Ok(None);
        };
        Duration::try_from_secs_f64(seconds)
            .ok()
            .filter(|d| !d.is_zero())
            .map(Some)
            .ok_or_else(|| {
                CafError::InvalidConfig(format!(
                    "calibration '{}' has invalid timeout_seconds {}",
                    self.name, seconds
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CafConfig {
    #[serde(default)]
    pub caf: DriverSection,
    #[serde(default)]
    pub backend: BackendConfig,
    pub calibrations: Vec<CalibrationConfig>,
    /// Directory relative input paths are resolved against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl CafConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            CafError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&raw)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn heartbeat(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.caf.heartbeat_seconds)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| {
                CafError::InvalidConfig(format!(
                    "caf.heartbeat_seconds must be a positive number, got {}",
                    self.caf.heartbeat_seconds
                ))
            })
    }

    pub fn validate(&self) -> Result<()> {
        self.heartbeat()?;
        if self.caf.max_iterations == 0 {
            return Err(CafError::InvalidConfig("caf.max_iterations must be at least 1".to_string()));
        }
        self.backend.validate()?;
        if self.calibrations.is_empty() {
            return Err(CafError::InvalidConfig("no calibrations configured".to_string()));
        }
        let mut names = HashSet::new();
        for cal in &self.calibrations {
            if !names.insert(cal.name.as_str()) {
                return Err(CafError::DuplicateName(cal.name.clone()));
            }
            cal.collector.validate()?;
            if cal.algorithms.is_empty() {
                return Err(CafError::InvalidConfig(format!(
                    "calibration '{}' has no algorithms",
                    cal.name
                )));
            }
            for alg in &cal.algorithms {
                alg.validate()?;
            }
            if cal.max_iterations == Some(0) {
                return Err(CafError::InvalidConfig(format!(
                    "calibration '{}' needs max_iterations >= 1",
                    cal.name
                )));
            }
            cal.timeout()?;
        }
        Ok(())
    }

    /// Gives `files` to every calibration without configured inputs.
    pub fn fill_missing_inputs(&mut self, files: &[String]) {
        for cal in self.calibrations.iter_mut().filter(|c| c.input_files.is_empty()) {
            cal.input_files = files.to_vec();
        }
    }

    pub fn driver_options(&self) -> Result<DriverOptions> {
        Ok(DriverOptions {
            output_dir: self.caf.output_dir.clone(),
            heartbeat: self.heartbeat()?,
        })
    }

    pub fn build(&self) -> Result<Caf> {
        self.validate()?;
        let backend = self.backend.build()?;
        self.build_with_backend(backend)
    }

    /// Like [`CafConfig::build`] with a caller supplied backend.
    pub fn build_with_backend(&self, backend: Box<dyn Backend>) -> Result<Caf> {
        self.validate()?;
        let base = self.base_dir.clone().unwrap_or_else(|| PathBuf::from("."));
        let default_args = self.backend.default_args();
        let mut caf = Caf::new(backend, self.driver_options()?)?;
        for cfg in &self.calibrations {
            let mut collector = cfg.collector.clone();
            if collector.max_files_per_subjob == SubjobSplit::Unsplit {
                if let Some(split) = self.backend.max_files_per_subjob {
                    collector.max_files_per_subjob = split;
                }
            }
            collector.sandbox_files = collector
                .sandbox_files
                .iter()
                .map(|p| if p.is_absolute() { p.clone() } else { base.join(p) })
                .collect();

            let mut cal = Calibration::new(cfg.name.clone(), collector)?
                .with_input_files(resolve_input_files(&cfg.input_files, &base)?)
                .with_max_iterations(cfg.max_iterations.unwrap_or(self.caf.max_iterations));
            for alg in &cfg.algorithms {
                cal.add_algorithm(alg.build()?);
            }
            for dep in &cfg.depends_on {
                cal.depends_on_name(dep)?;
            }
            cal.timeout = cfg.timeout()?;
            cal.iov_to_calibrate = cfg.iov;
            cal.payload_names = cfg.payload_names.clone();
            cal.recollect_on_iteration = cfg.recollect_on_iteration;
            cal.backend_args = cfg.backend_args.merged_over(&default_args);
            caf.add_calibration(cal)?;
        }
        Ok(caf)
    }
}

fn is_remote(entry: &str) -> bool {
    entry.contains("://")
}

fn has_glob(entry: &str) -> bool {
    entry.contains(&['*', '?', '['][..])
}

/// Expands configured input entries into concrete file paths.
///
/// Remote URLs are kept verbatim, directories are walked, globs expanded.
/// Local entries that match nothing are dropped with a warning.
pub fn resolve_input_files(entries: &[String], base: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in entries {
        if is_remote(entry) {
            files.push(entry.clone());
            continue;
        }
        let path = if Path::new(entry).is_absolute() {
            PathBuf::from(entry)
        } else {
            base.join(entry)
        };
        if path.is_dir() {
            files.extend(walk_files(&path)?);
        } else if path.is_file() {
            files.push(path.to_string_lossy().to_string());
        } else if has_glob(entry) {
            let pattern = path.to_string_lossy().to_string();
            let matches = glob::glob(&pattern)
                .map_err(|e| CafError::InvalidConfig(format!("invalid input glob '{}': {}", entry, e)))?;
            let mut found: Vec<String> = matches
                .flatten()
                .filter(|p| p.is_file())
                .map(|p| p.to_string_lossy().to_string())
                .collect();
            found.sort();
            if found.is_empty() {
                warn!(pattern = %entry, "input glob matched no files");
            }
            files.extend(found);
        } else {
            warn!(path = %path.display(), "input file does not exist; skipping");
        }
    }
    debug!(count = files.len(), "resolved input files");
    Ok(files)
}

/// Files under `dir`, recursively, in sorted order.
pub fn walk_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| CafError::Other(e.into()))?;
        if entry.file_type().is_file() {
            files.push(entry.path().to_string_lossy().to_string());
        }
    }
    Ok(files)
}

/// Command line input paths: directories are walked, files taken as is.
/// A path that does not exist is an error.
pub fn expand_input_paths(paths: &[PathBuf]) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            files.extend(walk_files(path)?);
        } else if path.is_file() {
            files.push(path.to_string_lossy().to_string());
        } else {
            return Err(CafError::InvalidConfig(format!(
                "input path {} does not exist",
                path.display()
            )));
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use caf_core::ensure_dir;
    use chrono::Utc;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "caf_config_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    const CONFIG: &str = r#"
caf:
  heartbeat_seconds: 0.5
backend:
  kind: local
  max_processes: 2
  queue: short
calibrations:
  - name: InitStage
    collector:
      command: [collect.sh]
      max_files_per_subjob: 1
    algorithms:
      - name: gain
        command: [gain.py]
    input_files: [data]
    iov: [1, 1, 1, -1]
  - name: RefineStage
    depends_on: [InitStage]
    max_iterations: 2
    timeout_seconds: 60
    collector:
      command: [collect.sh]
    algorithms:
      - name: refine
        command: [refine.py]
        strategy: run_by_run
    backend_args:
      queue: long
"#;

    #[test]
    fn parses_sections_with_defaults() {
        let config = CafConfig::from_yaml(CONFIG).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.caf.output_dir, PathBuf::from("calibration_results"));
        assert_eq!(config.caf.max_iterations, 5);
        assert_eq!(config.heartbeat().expect("heartbeat"), Duration::from_millis(500));
        assert_eq!(config.calibrations[0].iov, Some(Iov::new(1, 1, 1, -1).expect("iov")));
        assert_eq!(config.calibrations[1].depends_on, vec!["InitStage".to_string()]);
        assert_eq!(config.calibrations[1].backend_args.queue.as_deref(), Some("long"));
    }

    #[test]
    fn unknown_fields_and_bad_values_are_rejected() {
        assert!(CafConfig::from_yaml("calibrations: []\nextra: 1\n").is_err());
        let mut config = CafConfig::from_yaml(CONFIG).expect("parse");
        config.caf.heartbeat_seconds = 0.0;
        assert!(matches!(config.validate(), Err(CafError::InvalidConfig(_))));

        let mut config = CafConfig::from_yaml(CONFIG).expect("parse");
        config.calibrations[1].name = "InitStage".to_string();
        assert!(matches!(config.validate(), Err(CafError::DuplicateName(_))));

        let bad_split = CONFIG.replace("max_files_per_subjob: 1", "max_files_per_subjob: 0");
        assert!(CafConfig::from_yaml(&bad_split).is_err());
    }

    #[test]
    fn unrepresentable_timeouts_are_config_errors() {
        for bad in ["1.0e30", "-5", ".nan", "0"] {
            let yaml = CONFIG.replace("timeout_seconds: 60", &format!("timeout_seconds: {}", bad));
            let config = CafConfig::from_yaml(&yaml).expect("parse");
            assert!(
                matches!(config.validate(), Err(CafError::InvalidConfig(_))),
                "timeout {} accepted",
                bad
            );
            assert!(matches!(
                config.build_with_backend(Box::new(InMemoryBackend::default())),
                Err(CafError::InvalidConfig(_))
            ));
        }
        let config = CafConfig::from_yaml(CONFIG).expect("parse");
        assert_eq!(config.calibrations[1].timeout().expect("timeout"), Some(Duration::from_secs(60)));
    }

    #[test]
    fn build_resolves_inputs_and_dependencies() {
        let root = temp_root("build");
        let data = root.join("data");
        ensure_dir(&data.join("sub")).expect("data");
        fs::write(data.join("b.root"), b"").expect("b");
        fs::write(data.join("sub").join("a.root"), b"").expect("a");

        let mut config = CafConfig::from_yaml(CONFIG).expect("parse");
        config.base_dir = Some(root.clone());
        config.fill_missing_inputs(&["root://remote/file.root".to_string()]);
        let caf = config
            .build_with_backend(Box::new(InMemoryBackend::default()))
            .expect("build");

        let init = caf.calibration("InitStage").expect("init");
        assert_eq!(init.input_files.len(), 2);
        assert!(init.input_files[0].ends_with("b.root"));
        assert_eq!(init.backend_args.queue.as_deref(), Some("short"));
        let refine = caf.calibration("RefineStage").expect("refine");
        assert_eq!(refine.input_files, vec!["root://remote/file.root".to_string()]);
        assert_eq!(refine.max_iterations, 2);
        assert_eq!(refine.backend_args.queue.as_deref(), Some("long"));
        assert_eq!(caf.execution_order().expect("order"), vec!["InitStage", "RefineStage"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_local_inputs_are_dropped_and_cli_paths_must_exist() {
        let root = temp_root("inputs");
        fs::write(root.join("x.root"), b"").expect("x");
        let resolved = resolve_input_files(
            &["x.root".to_string(), "gone.root".to_string(), "*.root".to_string()],
            &root,
        )
        .expect("resolve");
        assert_eq!(resolved.len(), 2);
        assert!(expand_input_paths(&[root.join("gone.root")]).is_err());
        assert_eq!(expand_input_paths(&[root.clone()]).expect("walk").len(), 1);
        let _ = fs::remove_dir_all(root);
    }
}
