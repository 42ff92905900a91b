//! Property-based tests for dependency ordering and failure propagation.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use caf_runner::{
    partition_input_files, Caf, CalibrationState, FailureReason, InMemoryBackend, Job,
    SimulatedOutcome, SubjobSplit,
};
use common::{calibration, entered, options, temp_root, ScriptedAlgorithm};
use proptest::prelude::*;

/// Per calibration: polls before finishing, and whether its collector fails.
type Behaviour = (u32, bool);

/// A random DAG over `n` calibrations. Edges only point from a lower to a
/// higher index, so the graph is acyclic.
fn arb_plan() -> impl Strategy<Value = (Vec<Vec<usize>>, Vec<Behaviour>)> {
    (1usize..6).prop_flat_map(|n| {
        let deps = (0..n)
            .map(|j| prop::collection::vec(any::<bool>(), j))
            .collect::<Vec<_>>()
            .prop_map(|masks| {
                masks
                    .into_iter()
                    .map(|mask| {
                        mask.into_iter()
                            .enumerate()
                            .filter_map(|(i, on)| on.then_some(i))
                            .collect::<Vec<_>>()
                    })
                    .collect::<Vec<_>>()
            });
        let behaviour = prop::collection::vec((0u32..3, prop::bool::weighted(0.25)), n);
        (deps, behaviour)
    })
}

fn cal_name(i: usize) -> String {
    format!("Cal{}", i)
}

fn index_of(job: &str) -> Option<usize> {
    job.strip_prefix("Cal")?.split('_').next()?.parse().ok()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn dependents_start_only_after_dependencies_finish((deps, behaviour) in arb_plan()) {
        let root = temp_root("prop_dag");
        let policy_behaviour = behaviour.clone();
        let backend = InMemoryBackend::new(Box::new(move |job: &Job| {
            match index_of(&job.name).and_then(|i| policy_behaviour.get(i)) {
                Some(&(polls, true)) => SimulatedOutcome::failure_after(polls),
                Some(&(polls, false)) => SimulatedOutcome::success_after(polls),
                None => SimulatedOutcome::failure_after(0),
            }
        }));
        let log = backend.submission_log();
        let mut caf = Caf::new(Box::new(backend), options(&root)).expect("driver");
        for (j, dep_list) in deps.iter().enumerate() {
            let mut cal = calibration(&cal_name(j), ScriptedAlgorithm::ok(&format!("alg{}", j)), 2);
            for &d in dep_list {
                cal.depends_on_name(&cal_name(d)).expect("dependency");
            }
            caf.add_calibration(cal).expect("add");
        }

        let summary = caf.run().expect("run");

        // Edges point forward, so index order is a topological order.
        let mut expect_done = vec![false; deps.len()];
        for j in 0..deps.len() {
            expect_done[j] = !behaviour[j].1 && deps[j].iter().all(|&d| expect_done[d]);
        }

        for (j, dep_list) in deps.iter().enumerate() {
            let name = cal_name(j);
            let cal = caf.calibration(&name).expect("calibration");
            let submissions = log.for_prefix(&format!("{}_", name));
            prop_assert_eq!(*cal.state() == CalibrationState::Done, expect_done[j]);

            if dep_list.iter().all(|&d| expect_done[d]) {
                prop_assert_eq!(submissions.len(), 2);
                let first = submissions.iter().map(|r| r.sequence).min().unwrap();
                for &d in dep_list {
                    let dep_name = cal_name(d);
                    let dep = caf.calibration(&dep_name).expect("dependency");
                    let last_dep = log
                        .for_prefix(&format!("{}_", dep_name))
                        .iter()
                        .map(|r| r.sequence)
                        .max()
                        .unwrap();
                    prop_assert!(first > last_dep);
                    prop_assert!(entered(cal, "collecting") > entered(dep, "done"));
                }
            } else {
                prop_assert!(submissions.is_empty());
                let blocked = matches!(
                    cal.state(),
                    CalibrationState::Failed(FailureReason::BlockedByAncestor { .. })
                );
                prop_assert!(blocked);
            }
        }
        prop_assert_eq!(summary.all_done(), expect_done.iter().all(|d| *d));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn partition_preserves_files_and_respects_cap(count in 0usize..40, cap in 1usize..8) {
        let files: Vec<String> = (0..count).map(|i| format!("f{}.root", i)).collect();
        let split = SubjobSplit::max_files(cap).expect("split");
        let chunks = partition_input_files(&files, split);
        prop_assert!(!chunks.is_empty());
        prop_assert!(chunks.iter().all(|c| c.len() <= cap));
        prop_assert_eq!(chunks.concat(), files.clone());
        if count > 0 {
            prop_assert_eq!(chunks.len(), count.div_ceil(cap));
        }
        prop_assert_eq!(partition_input_files(&files, SubjobSplit::Unsplit), vec![files]);
    }
}
