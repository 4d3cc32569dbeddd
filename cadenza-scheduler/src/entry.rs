// SPDX-License-Identifier: MIT

//! The public face of the scheduler.
//!
//! A [`Realiser`] bundles a destination store, the substituters to
//! consult, a builder and the settings. Each call spins up a fresh
//! worker, so concurrent calls only meet each other through the store
//! and the cross-process path locks.

use std::sync::Arc;

use cadenza_store::Store;
use cadenza_store_core::{
    BasicDerivation, BuildMode, BuildResult, BuildStatus, DerivedPath, KeyedBuildResult,
    OutputSpec, StorePath,
};
use tokio::sync::watch;
use tracing::debug;

use crate::builder::DerivationBuilder;
use crate::counters::{Counts, ProgressCounters};
use crate::error::SchedulerError;
use crate::goal::{ExitCode, GoalFuture, WorkResult};
use crate::settings::SchedulerSettings;
use crate::worker::Worker;

pub struct Realiser {
    store: Arc<dyn Store>,
    substituters: Vec<Arc<dyn Store>>,
    builder: Arc<dyn DerivationBuilder>,
    settings: Arc<SchedulerSettings>,
    counters: Arc<ProgressCounters>,
}

impl Realiser {
    pub fn new(store: Arc<dyn Store>, builder: Arc<dyn DerivationBuilder>) -> Self {
        Realiser {
            store,
            substituters: Vec::new(),
            builder,
            settings: Arc::new(SchedulerSettings::default()),
            counters: Arc::new(ProgressCounters::default()),
        }
    }

    pub fn with_substituters(mut self, substituters: Vec<Arc<dyn Store>>) -> Self {
        self.substituters = substituters;
        self
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    /// Progress counters shared by every call on this realiser.
    pub fn counters(&self) -> Counts {
        self.counters.snapshot()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Counts> {
        self.counters.subscribe()
    }

    fn worker(&self) -> Arc<Worker> {
        Worker::new(
            self.store.clone(),
            self.substituters.clone(),
            self.builder.clone(),
            self.settings.clone(),
            self.counters.clone(),
        )
    }

    async fn top_goals(
        &self,
        worker: &Arc<Worker>,
        requests: &[DerivedPath],
        build_mode: BuildMode,
    ) -> Vec<GoalFuture> {
        let mut goals = Vec::with_capacity(requests.len());
        for request in requests {
            let goal = match request {
                DerivedPath::Built { drv_path, outputs } => {
                    worker
                        .make_derivation_goal(drv_path.clone(), outputs.clone(), build_mode)
                        .await
                }
                DerivedPath::Opaque(path) => {
                    worker
                        .make_substitution_goal(
                            path.clone(),
                            build_mode == BuildMode::Repair,
                            None,
                        )
                        .await
                }
            };
            goals.push(goal);
        }
        goals
    }

    /// Realises every request, failing if any of them fails. The error
    /// carries the aggregate exit status bitmask.
    pub async fn build_paths(
        &self,
        requests: &[DerivedPath],
        build_mode: BuildMode,
    ) -> Result<(), SchedulerError> {
        let worker = self.worker();
        let goals = self.top_goals(&worker, requests, build_mode).await;
        let results = worker.run(goals).await;

        let mut failed = Vec::new();
        for (request, result) in requests.iter().zip(&results) {
            match result {
                Some(result) if result.success() => {}
                Some(result) => {
                    debug!(request = %request, "request failed");
                    failed.push(
                        result
                            .error
                            .clone()
                            .unwrap_or_else(|| format!("building '{request}' failed")),
                    );
                }
                None => failed.push(format!(
                    "building '{request}' was not finished because another build failed"
                )),
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(SchedulerError::BuildsFailed {
                failed,
                exit_status: worker.failing_exit_status(),
            })
        }
    }

    /// Like [`build_paths`](Self::build_paths), but reports the
    /// per-request outcome instead of failing on the first error.
    pub async fn build_paths_with_results(
        &self,
        requests: &[DerivedPath],
        build_mode: BuildMode,
    ) -> Result<Vec<KeyedBuildResult>, SchedulerError> {
        let worker = self.worker();
        let goals = self.top_goals(&worker, requests, build_mode).await;
        let results = worker.run(goals).await;

        Ok(requests
            .iter()
            .zip(results)
            .map(|(request, result)| {
                let result = match result {
                    Some(work) => match request {
                        DerivedPath::Built { outputs, .. } => work.result.restrict_to(outputs),
                        DerivedPath::Opaque(_) => work.result,
                    },
                    None => {
                        let mut aborted = BuildResult::new(BuildStatus::MiscFailure);
                        aborted.error_msg = Some(format!(
                            "building '{request}' was not finished because another build failed"
                        ));
                        aborted
                    }
                };
                KeyedBuildResult {
                    path: request.clone(),
                    result,
                }
            })
            .collect())
    }

    /// Realises selected outputs of a derivation handed over as a
    /// value (it need not exist in the store) and returns the detailed
    /// result, whether or not it succeeded.
    pub async fn build_derivation(
        &self,
        drv_path: &StorePath,
        drv: &BasicDerivation,
        outputs: OutputSpec,
        build_mode: BuildMode,
    ) -> Result<BuildResult, SchedulerError> {
        let worker = self.worker();
        let goal = worker
            .make_basic_derivation_goal(drv_path.clone(), drv.clone(), outputs, build_mode)
            .await;
        let results = worker.run(vec![goal]).await;
        let work = results
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| SchedulerError::Misc("derivation goal vanished".into()))?;
        Ok(work.result)
    }

    /// Makes one store path valid, by substitution only.
    pub async fn ensure_path(&self, path: &StorePath) -> Result<(), SchedulerError> {
        if self.store.is_valid_path(path).await? {
            return Ok(());
        }
        let worker = self.worker();
        let goal = worker.make_substitution_goal(path.clone(), false, None).await;
        let results = worker.run(vec![goal]).await;
        match results.into_iter().next().flatten() {
            Some(result) if result.success() => Ok(()),
            _ => Err(SchedulerError::CannotSubstitute(path.clone())),
        }
    }

    /// Restores a corrupt or missing path: substitute it again, and if
    /// no substituter can, rebuild it from its deriver.
    pub async fn repair_path(&self, path: &StorePath) -> Result<(), SchedulerError> {
        let worker = self.worker();
        let goal = worker.make_substitution_goal(path.clone(), true, None).await;
        let results = worker.run(vec![goal]).await;
        let substituted = matches!(
            results.into_iter().next().flatten(),
            Some(result) if result.success()
        );
        if substituted {
            return Ok(());
        }

        let deriver = self
            .store
            .query_path_info(path)
            .await?
            .and_then(|info| info.deriver);
        let Some(deriver) = deriver else {
            return Err(SchedulerError::CannotRepair(path.clone()));
        };
        if !self.store.is_valid_path(&deriver).await? {
            return Err(SchedulerError::CannotRepair(path.clone()));
        }
        debug!(path = %path, deriver = %deriver, "repairing by rebuilding");

        let worker = self.worker();
        let goal = worker
            .make_derivation_goal(deriver, OutputSpec::All, BuildMode::Repair)
            .await;
        let results = worker.run(vec![goal]).await;
        match results.into_iter().next().flatten() {
            Some(WorkResult {
                exit_code: ExitCode::Success,
                ..
            }) => Ok(()),
            _ => Err(SchedulerError::CannotRepair(path.clone())),
        }
    }
}
