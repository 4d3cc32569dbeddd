// SPDX-License-Identifier: MIT

//! Shared state of one realisation run.
//!
//! The worker owns the goal caches that deduplicate in-flight work, the
//! semaphores bounding concurrency, and the failure flags feeding the
//! final exit status. Goals hold an `Arc<Worker>`; [`Worker::run`]
//! clears the caches when the run ends so those cycles collapse.

use std::collections::BTreeMap;
use std::sync::Arc;

use cadenza_store::{Store, StoreError};
use cadenza_store_core::{
    BasicDerivation, BuildMode, ContentAddress, DrvOutput, OutputSpec, StorePath,
};
use futures::FutureExt as _;
use futures::StreamExt as _;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use crate::builder::DerivationBuilder;
use crate::counters::ProgressCounters;
use crate::derivation_goal::{self, WantedOutputs};
use crate::goal::{GoalFuture, WorkResult};
use crate::hook::HookState;
use crate::settings::SchedulerSettings;
use crate::{drv_output_substitution_goal, substitution_goal};

/// A cached derivation goal: its shared wanted-output set (for
/// widening) and its result future.
pub(crate) struct DerivationGoalHandle {
    pub wanted: Arc<WantedOutputs>,
    pub future: GoalFuture,
}

#[derive(Debug, Default, Clone, Copy)]
struct FailureFlags {
    permanent_failure: bool,
    timed_out: bool,
    hash_mismatch: bool,
    check_mismatch: bool,
}

pub(crate) struct Worker {
    pub store: Arc<dyn Store>,
    /// Substituters in preference order.
    pub substituters: Vec<Arc<dyn Store>>,
    pub builder: Arc<dyn DerivationBuilder>,
    pub settings: Arc<SchedulerSettings>,
    pub counters: Arc<ProgressCounters>,
    pub build_slots: Arc<Semaphore>,
    pub substitution_slots: Arc<Semaphore>,
    pub hook_slots: Arc<Semaphore>,
    pub hook: Mutex<HookState>,
    derivation_goals: Mutex<BTreeMap<StorePath, DerivationGoalHandle>>,
    substitution_goals: Mutex<BTreeMap<StorePath, GoalFuture>>,
    drv_output_goals: Mutex<BTreeMap<DrvOutput, GoalFuture>>,
    flags: std::sync::Mutex<FailureFlags>,
    /// Cache of content-integrity checks, so repair scans each path at
    /// most once per run.
    contents_good: Mutex<BTreeMap<StorePath, bool>>,
}

impl Worker {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        mut substituters: Vec<Arc<dyn Store>>,
        builder: Arc<dyn DerivationBuilder>,
        settings: Arc<SchedulerSettings>,
        counters: Arc<ProgressCounters>,
    ) -> Arc<Worker> {
        substituters.sort_by_key(|s| (s.priority(), s.uri()));
        Arc::new(Worker {
            store,
            substituters,
            builder,
            build_slots: Arc::new(Semaphore::new(settings.max_build_jobs)),
            substitution_slots: Arc::new(Semaphore::new(settings.max_substitution_jobs)),
            hook_slots: Arc::new(Semaphore::new(settings.max_hook_instances)),
            settings,
            counters,
            hook: Mutex::new(HookState::default()),
            derivation_goals: Mutex::new(BTreeMap::new()),
            substitution_goals: Mutex::new(BTreeMap::new()),
            drv_output_goals: Mutex::new(BTreeMap::new()),
            flags: std::sync::Mutex::new(FailureFlags::default()),
            contents_good: Mutex::new(BTreeMap::new()),
        })
    }

    /// Returns the goal realising `wanted` outputs of `drv_path`,
    /// creating it if needed. An existing live goal is widened instead;
    /// a goal that already finished is replaced, and the fresh goal
    /// sees whatever the old one left in the store.
    pub(crate) async fn make_derivation_goal(
        self: &Arc<Self>,
        drv_path: StorePath,
        wanted: OutputSpec,
        build_mode: BuildMode,
    ) -> GoalFuture {
        self.derivation_goal_inner(drv_path, None, wanted, build_mode)
            .await
    }

    /// Like [`make_derivation_goal`](Self::make_derivation_goal), but
    /// for a derivation that is handed over as a value and need not
    /// exist in the store.
    pub(crate) async fn make_basic_derivation_goal(
        self: &Arc<Self>,
        drv_path: StorePath,
        drv: BasicDerivation,
        wanted: OutputSpec,
        build_mode: BuildMode,
    ) -> GoalFuture {
        self.derivation_goal_inner(drv_path, Some(drv), wanted, build_mode)
            .await
    }

    async fn derivation_goal_inner(
        self: &Arc<Self>,
        drv_path: StorePath,
        drv: Option<BasicDerivation>,
        wanted: OutputSpec,
        build_mode: BuildMode,
    ) -> GoalFuture {
        let mut goals = self.derivation_goals.lock().await;
        if let Some(handle) = goals.get(&drv_path) {
            if handle.wanted.add(&wanted) {
                return handle.future.clone();
            }
            debug!(drv = %drv_path, "finished goal cannot widen, starting a fresh one");
        }
        let handle =
            derivation_goal::spawn(self.clone(), drv_path.clone(), drv, wanted, build_mode);
        let future = handle.future.clone();
        goals.insert(drv_path, handle);
        future
    }

    /// Returns the goal making `path` valid, creating it if needed.
    /// The `repair` and `ca` hints of the first requester win. A cached
    /// goal that already failed is replaced, so a later requester gets
    /// a fresh attempt.
    pub(crate) async fn make_substitution_goal(
        self: &Arc<Self>,
        path: StorePath,
        repair: bool,
        ca: Option<ContentAddress>,
    ) -> GoalFuture {
        let mut goals = self.substitution_goals.lock().await;
        if let Some(future) = goals.get(&path) {
            match future.peek() {
                Some(result) if !result.success() => {
                    debug!(path = %path, "replacing failed substitution goal");
                }
                _ => return future.clone(),
            }
        }
        let future = substitution_goal::spawn(self.clone(), path.clone(), repair, ca);
        goals.insert(path, future.clone());
        future
    }

    /// Returns the goal realising one derivation output by querying
    /// substituters for its realisation. Failed finished goals are
    /// replaced like in
    /// [`make_substitution_goal`](Self::make_substitution_goal).
    pub(crate) async fn make_drv_output_goal(self: &Arc<Self>, id: DrvOutput) -> GoalFuture {
        let mut goals = self.drv_output_goals.lock().await;
        if let Some(future) = goals.get(&id) {
            match future.peek() {
                Some(result) if !result.success() => {
                    debug!(id = %id, "replacing failed realisation goal");
                }
                _ => return future.clone(),
            }
        }
        let future = drv_output_substitution_goal::spawn(self.clone(), id.clone());
        goals.insert(id, future.clone());
        future
    }

    /// Folds a finished goal's failure classification into the run-wide
    /// flags. Every goal calls this exactly once.
    pub(crate) fn note_result(&self, result: &WorkResult) {
        let mut flags = match self.flags.lock() {
            Ok(flags) => flags,
            Err(poisoned) => poisoned.into_inner(),
        };
        flags.permanent_failure |= result.permanent_failure;
        flags.timed_out |= result.timed_out;
        flags.hash_mismatch |= result.hash_mismatch;
        flags.check_mismatch |= result.check_mismatch;
    }

    /// The exit status summarising why this run failed: a bitmask of
    /// 0x04 (build failure), 0x01 (timeout), 0x02 (output hash
    /// mismatch) and 0x08 (check mismatch), offset into the 0x60 range
    /// to stay clear of ordinary exit codes; plain 1 when nothing more
    /// specific was recorded.
    pub(crate) fn failing_exit_status(&self) -> u32 {
        let flags = match self.flags.lock() {
            Ok(flags) => *flags,
            Err(poisoned) => *poisoned.into_inner(),
        };
        let mut mask = 0;
        if flags.permanent_failure || flags.timed_out || flags.hash_mismatch {
            mask |= 0x04;
        }
        if flags.timed_out {
            mask |= 0x01;
        }
        if flags.hash_mismatch {
            mask |= 0x02;
        }
        if flags.check_mismatch {
            mask |= 0x08;
        }
        if mask != 0 {
            mask |= 0x60;
        }
        if mask != 0 { mask } else { 1 }
    }

    /// Whether the stored contents of `path` are intact, memoized for
    /// the run.
    pub(crate) async fn path_contents_good(&self, path: &StorePath) -> Result<bool, StoreError> {
        let mut cache = self.contents_good.lock().await;
        if let Some(&good) = cache.get(path) {
            return Ok(good);
        }
        let good = self.store.path_contents_good(path).await?;
        cache.insert(path.clone(), good);
        Ok(good)
    }

    /// Records that `path` was just (re)written, so later integrity
    /// queries in this run trust it.
    pub(crate) async fn mark_contents_good(&self, path: StorePath) {
        self.contents_good.lock().await.insert(path, true);
    }

    /// Drives the given top-level goals to completion and returns their
    /// results in request order. Without `keep_going`, waiting stops at
    /// the first failure and the remaining slots come back as `None`;
    /// their tasks keep running detached but this run no longer reports
    /// on them.
    pub(crate) async fn run(self: &Arc<Self>, tops: Vec<GoalFuture>) -> Vec<Option<WorkResult>> {
        let mut results: Vec<Option<WorkResult>> = vec![None; tops.len()];
        let mut pending: FuturesUnordered<_> = tops
            .into_iter()
            .enumerate()
            .map(|(index, future)| future.map(move |result| (index, result)))
            .collect();
        while let Some((index, result)) = pending.next().await {
            let failed = !result.success();
            results[index] = Some(result);
            if failed && !self.settings.keep_going {
                debug!("a top-level goal failed, not waiting for the rest");
                break;
            }
        }
        drop(pending);

        // break the goal->worker->goal reference cycles
        self.derivation_goals.lock().await.clear();
        self.substitution_goals.lock().await.clear();
        self.drv_output_goals.lock().await.clear();
        results
    }
}

/// Runs a goal body as its own task and publishes the result as a
/// clonable future. A panicking goal resolves to a `MiscFailure`.
pub(crate) fn spawn_goal(
    body: BoxFuture<'static, WorkResult>,
) -> GoalFuture {
    tokio::spawn(body)
        .map(|joined| match joined {
            Ok(result) => result,
            Err(e) => WorkResult::wrecked(e),
        })
        .boxed()
        .shared()
}
