use crate::calibration::{Calibration, FailureReason, StateChange};
use crate::error::Result;
use caf_core::{atomic_write_json_pretty, Iov};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommittedPayload {
    pub name: String,
    pub revision: u32,
    pub iov: Iov,
    /// Identical content was already stored; nothing was appended.
    pub unchanged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationSummary {
    pub name: String,
    pub state: String,
    pub reason: Option<String>,
    pub failure: Option<FailureReason>,
    pub iterations: usize,
    pub payloads: Vec<CommittedPayload>,
    pub history: Vec<StateChange>,
}

impl CalibrationSummary {
    pub fn from_calibration(calibration: &Calibration, payloads: Vec<CommittedPayload>) -> Self {
        let failure = match calibration.state() {
            crate::calibration::CalibrationState::Failed(reason) => Some(reason.clone()),
            _ => None,
        };
        Self {
            name: calibration.name().to_string(),
            state: calibration.state().name().to_string(),
            reason: failure.as_ref().map(|f| f.to_string()),
            failure,
            iterations: calibration.attempts(),
            payloads,
            history: calibration.history().to_vec(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == "done"
    }
}

/// Outcome of one driver run, written to `<output_dir>/summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub output_dir: PathBuf,
    pub database: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub order: Vec<String>,
    pub calibrations: Vec<CalibrationSummary>,
}

impl RunSummary {
    pub fn all_done(&self) -> bool {
        self.calibrations.iter().all(CalibrationSummary::is_done)
    }

    pub fn calibration(&self, name: &str) -> Option<&CalibrationSummary> {
        self.calibrations.iter().find(|c| c.name == name)
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, &self.to_json()?)?;
        Ok(())
    }

    /// Human readable report, one block per calibration.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for cal in &self.calibrations {
            match &cal.reason {
                Some(reason) => out.push_str(&format!("{}: {} ({})\n", cal.name, cal.state, reason)),
                None => out.push_str(&format!(
                    "{}: {} after {} iteration(s)\n",
                    cal.name, cal.state, cal.iterations
                )),
            }
            for p in &cal.payloads {
                out.push_str(&format!(
                    "  {} rev {} iov {}{}\n",
                    p.name,
                    p.revision,
                    p.iov,
                    if p.unchanged { " (unchanged)" } else { "" }
                ));
            }
        }
        out.push_str(&format!("database: {}\n", self.database.display()));
        out
    }
}
