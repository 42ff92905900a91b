//! Helpers shared by the driver integration tests.

#![allow(dead_code)]

use caf_core::{ExpRun, Iov};
use caf_runner::{
    Algorithm, AlgorithmInput, AlgorithmOutput, AlgorithmRunner, Calibration, CollectorSpec,
    DriverOptions, ResultCode, SubjobSplit,
};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A fresh parent directory; the driver output dir inside it does not exist yet.
pub fn temp_root(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "caf_it_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    std::fs::create_dir_all(&root).expect("temp dir");
    root
}

pub fn options(root: &PathBuf) -> DriverOptions {
    DriverOptions {
        output_dir: root.join("results"),
        heartbeat: Duration::from_millis(1),
    }
}

/// Answers with `codes[i]` on the i-th call (the last code repeats).
pub struct ScriptedAlgorithm {
    pub name: String,
    pub codes: Vec<ResultCode>,
    pub runs: Vec<ExpRun>,
    pub payload: Option<String>,
    pub iov: Option<Iov>,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedAlgorithm {
    pub fn ok(name: &str) -> Self {
        Self {
            name: name.to_string(),
            codes: vec![ResultCode::Ok],
            runs: vec![ExpRun::new(1, 1), ExpRun::new(1, 2), ExpRun::new(1, 3)],
            payload: Some(format!("{}Payload", name)),
            iov: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_codes(mut self, codes: Vec<ResultCode>) -> Self {
        self.codes = codes;
        self
    }

    pub fn with_iov(mut self, iov: Iov) -> Self {
        self.iov = Some(iov);
        self
    }

    pub fn with_payload(mut self, payload: &str) -> Self {
        self.payload = Some(payload.to_string());
        self
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn runner(self) -> AlgorithmRunner {
        AlgorithmRunner::new(Box::new(self))
    }
}

impl Algorithm for ScriptedAlgorithm {
    fn name(&self) -> &str {
        &self.name
    }

    fn runs_in_data(&mut self, _input: &AlgorithmInput) -> caf_runner::Result<Vec<ExpRun>> {
        Ok(self.runs.clone())
    }

    fn execute(
        &mut self,
        input: &AlgorithmInput,
        _runs: &[ExpRun],
        iteration: u32,
    ) -> caf_runner::Result<AlgorithmOutput> {
        assert!(!input.collector_outputs.is_empty(), "algorithm ran without collector output");
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let code = self
            .codes
            .get(call)
            .or_else(|| self.codes.last())
            .copied()
            .unwrap_or(ResultCode::Ok);
        let mut out = AlgorithmOutput::new(code);
        if let Some(payload) = &self.payload {
            out = out.with_payload(payload.clone(), format!("{}:{}", payload, iteration));
        }
        if let Some(iov) = self.iov {
            out = out.with_iov(iov);
        }
        Ok(out)
    }
}

pub fn input_files(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("/data/e1_r{}.root", i)).collect()
}

/// A calibration with one file per subjob and the given algorithm.
pub fn calibration(name: &str, algorithm: ScriptedAlgorithm, files: usize) -> Calibration {
    let collector = CollectorSpec::new(vec!["collect".to_string()])
        .with_max_files_per_subjob(SubjobSplit::max_files(1).expect("split"));
    Calibration::new(name, collector)
        .expect("calibration")
        .with_algorithm(algorithm.runner())
        .with_input_files(input_files(files))
}

/// Sequence number of the first transition of `cal` into `state`.
pub fn entered(cal: &Calibration, state: &str) -> Option<u64> {
    cal.history().iter().find(|h| h.to == state).map(|h| h.sequence)
}
