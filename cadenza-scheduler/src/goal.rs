// SPDX-License-Identifier: MIT

//! The common currency of all goals: their results, and waiting on sets
//! of them.
//!
//! A goal runs as one task; its result is published through a shared
//! future so that every requester of the same store object awaits the
//! same computation.

use cadenza_store_core::{BuildResult, BuildStatus, StorePath};
use futures::future::{BoxFuture, Shared};

/// How a goal ended, beyond the detailed [`BuildResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    Failed,
    /// Substitution was requested but nobody advertises the path. The
    /// requesting derivation just builds instead; only a failure at the
    /// top level.
    NoSubstituters,
    /// References of a substitutable path could not be realised.
    IncompleteClosure,
}

/// The published outcome of one goal.
#[derive(Debug, Clone)]
pub struct WorkResult {
    pub exit_code: ExitCode,
    pub result: BuildResult,
    /// The rendered error, for aggregation at the entry points.
    pub error: Option<String>,
    pub permanent_failure: bool,
    pub timed_out: bool,
    pub hash_mismatch: bool,
    pub check_mismatch: bool,
    /// The derivation or store path this goal was about.
    pub path: Option<StorePath>,
}

impl WorkResult {
    pub fn new(exit_code: ExitCode, result: BuildResult) -> Self {
        WorkResult {
            exit_code,
            result,
            error: None,
            permanent_failure: false,
            timed_out: false,
            hash_mismatch: false,
            check_mismatch: false,
            path: None,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == ExitCode::Success
    }

    /// The result for a goal task that panicked.
    pub(crate) fn wrecked(reason: impl std::fmt::Display) -> Self {
        let mut result = BuildResult::new(BuildStatus::MiscFailure);
        result.error_msg = Some(format!("goal task failed: {reason}"));
        let mut work = WorkResult::new(ExitCode::Failed, result);
        work.error = work.result.error_msg.clone();
        work
    }
}

/// A goal's one-result-many-waiters handle.
pub type GoalFuture = Shared<BoxFuture<'static, WorkResult>>;

/// Tallies over a completed set of dependency goals.
pub(crate) struct WaitOutcome {
    pub results: Vec<WorkResult>,
    pub nr_failed: usize,
    pub nr_no_substituters: usize,
    pub nr_incomplete_closure: usize,
}

impl WaitOutcome {
    /// Failures that are real failures, not mere unavailability.
    pub fn nr_substituter_failures(&self) -> usize {
        self.nr_failed
            .saturating_sub(self.nr_no_substituters + self.nr_incomplete_closure)
    }
}

/// Awaits every dependency to a terminal state, then tallies.
pub(crate) async fn wait_for_goals(goals: Vec<GoalFuture>) -> WaitOutcome {
    let results = futures::future::join_all(goals).await;
    let mut outcome = WaitOutcome {
        nr_failed: 0,
        nr_no_substituters: 0,
        nr_incomplete_closure: 0,
        results: Vec::new(),
    };
    for result in &results {
        match result.exit_code {
            ExitCode::Success => {}
            ExitCode::Failed => outcome.nr_failed += 1,
            ExitCode::NoSubstituters => {
                outcome.nr_failed += 1;
                outcome.nr_no_substituters += 1;
            }
            ExitCode::IncompleteClosure => {
                outcome.nr_failed += 1;
                outcome.nr_incomplete_closure += 1;
            }
        }
    }
    outcome.results = results;
    outcome
}
