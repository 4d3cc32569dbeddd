// SPDX-License-Identifier: MIT

//! Realising the wanted outputs of one derivation.
//!
//! The goal tries, in order: accepting outputs that are already valid,
//! substituting missing outputs, and building - remotely through the
//! build hook when one is configured, locally otherwise. Derivations
//! whose inputs are content-addressed are first rewritten to their
//! resolved form and delegated to a goal for the resolved derivation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cadenza_store::write_derivation;
use cadenza_store_core::derivation::hash_placeholder;
use cadenza_store_core::store_path::StorePathSet;
use cadenza_store_core::{
    BasicDerivation, BuildMode, BuildResult, BuildStatus, ContentAddress, DerivationOutput,
    DrvOutput, Hash, OutputName, OutputSpec, Realisation, StorePath,
};
use futures::FutureExt as _;
use tracing::{debug, info, warn};

use crate::builder::{BuildContext, BuildLimits, BuildOutcome, BuiltOutput, FailureReason};
use crate::error::SchedulerError;
use crate::goal::{ExitCode, WorkResult, wait_for_goals};
use crate::hook::{HookBuildOutcome, HookInstance, HookReply};
use crate::pathlocks::PathLocks;
use crate::worker::{DerivationGoalHandle, Worker, spawn_goal};

/// The output set a derivation goal is realising, shared with the
/// worker's goal cache so later requesters can widen it.
pub(crate) struct WantedOutputs {
    inner: std::sync::Mutex<WantedInner>,
}

struct WantedInner {
    spec: OutputSpec,
    restart: Restart,
    done: bool,
}

#[derive(PartialEq, Eq)]
enum Restart {
    NotNeeded,
    Needed,
    /// The build is running and will produce every output anyway.
    BuildCoversAll,
}

impl WantedOutputs {
    fn new(spec: OutputSpec) -> Arc<Self> {
        Arc::new(WantedOutputs {
            inner: std::sync::Mutex::new(WantedInner {
                spec,
                restart: Restart::NotNeeded,
                done: false,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WantedInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Widens the wanted set. `false` means the goal already finished
    /// and the caller has to start a replacement.
    pub(crate) fn add(&self, spec: &OutputSpec) -> bool {
        let mut inner = self.lock();
        if inner.done {
            return false;
        }
        if inner.spec.union_with(spec) && inner.restart == Restart::NotNeeded {
            inner.restart = Restart::Needed;
        }
        true
    }

    fn current(&self) -> OutputSpec {
        self.lock().spec.clone()
    }

    /// Consumes a pending restart request, if any.
    fn take_restart(&self) -> bool {
        let mut inner = self.lock();
        if inner.restart == Restart::Needed {
            inner.restart = Restart::NotNeeded;
            true
        } else {
            false
        }
    }

    /// After this, widening no longer requests a restart.
    fn note_build_started(&self) {
        self.lock().restart = Restart::BuildCoversAll;
    }

    /// Tries to finish the goal; `false` means outputs were added since
    /// the last pass and the goal must run once more.
    fn finish(&self) -> bool {
        let mut inner = self.lock();
        if inner.restart == Restart::Needed {
            inner.restart = Restart::NotNeeded;
            false
        } else {
            inner.done = true;
            true
        }
    }

    fn mark_done(&self) {
        self.lock().done = true;
    }
}

pub(crate) fn spawn(
    worker: Arc<Worker>,
    drv_path: StorePath,
    given_drv: Option<BasicDerivation>,
    spec: OutputSpec,
    build_mode: BuildMode,
) -> DerivationGoalHandle {
    let wanted = WantedOutputs::new(spec);
    let goal = Goal {
        worker,
        drv_path,
        given_drv,
        wanted: wanted.clone(),
        build_mode,
    };
    let future = spawn_goal(
        async move {
            let result = goal.run().await;
            goal.worker.note_result(&result);
            result
        }
        .boxed(),
    );
    DerivationGoalHandle { wanted, future }
}

struct Goal {
    worker: Arc<Worker>,
    drv_path: StorePath,
    /// A derivation handed over as a value; when absent the goal reads
    /// it from the store, substituting the `.drv` file if necessary.
    given_drv: Option<BasicDerivation>,
    wanted: Arc<WantedOutputs>,
    build_mode: BuildMode,
}

/// Whether realising the inputs ended the pass or handed control back
/// for another round of output substitution.
enum InputsRealised {
    RetrySubstitution,
    Done(WorkResult),
}

/// What came of trying to substitute the missing outputs.
enum Substitution {
    /// A terminal result for the goal.
    Finished(WorkResult),
    /// Every failure was a dependency closure that could not be
    /// completed; worth one retry.
    IncompleteClosure,
    /// Substitution is off the table; proceed to building.
    Build,
}

/// Validity of one wanted output at some point in time.
struct OutputStatus {
    path: Option<StorePath>,
    valid: bool,
    /// Only meaningful when `valid` and repairing.
    good: bool,
}

impl Goal {
    async fn run(&self) -> WorkResult {
        loop {
            let result = match self.realise().await {
                Ok(result) => result,
                Err(e) => self.failed(e),
            };
            // outputs widened after the last validity check force
            // another pass; a failed pass would only fail again
            if !result.success() || self.wanted.finish() {
                if !result.success() {
                    self.wanted.mark_done();
                }
                return result;
            }
            debug!(drv = %self.drv_path, "wanted outputs grew, re-checking");
        }
    }

    fn done(&self, exit_code: ExitCode, result: BuildResult) -> WorkResult {
        let mut work = WorkResult::new(exit_code, result);
        work.error = work.result.error_msg.clone();
        work.path = Some(self.drv_path.clone());
        work
    }

    fn failed(&self, e: SchedulerError) -> WorkResult {
        let status = match &e {
            SchedulerError::MissingWantedOutput { .. }
            | SchedulerError::ImpureInput { .. }
            | SchedulerError::Derivation(_) => BuildStatus::PermanentFailure,
            SchedulerError::LockTimeout(..) => BuildStatus::TransientFailure,
            _ => BuildStatus::MiscFailure,
        };
        let mut result = BuildResult::new(status);
        result.error_msg = Some(e.to_string());
        let mut work = self.done(ExitCode::Failed, result);
        work.permanent_failure = status == BuildStatus::PermanentFailure;
        work
    }

    async fn realise(&self) -> Result<WorkResult, SchedulerError> {
        let drv = match &self.given_drv {
            Some(drv) => drv.clone(),
            None => {
                // the derivation itself may need to be fetched first
                if !self.worker.store.is_valid_path(&self.drv_path).await? {
                    let goal = self
                        .worker
                        .make_substitution_goal(self.drv_path.clone(), false, None)
                        .await;
                    if !goal.await.success() {
                        return Err(SchedulerError::Misc(format!(
                            "cannot realise unknown derivation '{}'",
                            self.drv_path
                        )));
                    }
                }
                let drv = self.worker.store.read_derivation(&self.drv_path).await?;
                self.worker.store.add_temp_root(&self.drv_path).await?;
                drv
            }
        };

        let mut may_retry_substitution = true;
        loop {
            let wanted_names = drv.wanted_output_names(&self.wanted.current()).map_err(
                |e| match e {
                    cadenza_store_core::derivation::DerivationError::NoSuchOutput(_, output) => {
                        SchedulerError::MissingWantedOutput {
                            drv_path: self.drv_path.clone(),
                            output,
                        }
                    }
                    e => e.into(),
                },
            )?;

            let statuses = self.check_path_validity(&drv, &wanted_names).await?;
            if self.build_mode == BuildMode::Check && !statuses.values().all(|s| s.valid) {
                return Err(SchedulerError::CheckNotPossible(self.drv_path.clone()));
            }
            if self.build_mode != BuildMode::Check
                && statuses.values().all(|s| s.valid && s.good)
            {
                if self.build_mode == BuildMode::Repair {
                    return self.repair_closure(&drv, &statuses).await;
                }
                let built_outputs = self.collect_realisations(&drv, &statuses).await?;
                let mut result = BuildResult::new(BuildStatus::AlreadyValid);
                result.built_outputs = built_outputs;
                return Ok(self.done(ExitCode::Success, result));
            }

            let mut retry_substitution = false;
            if self.build_mode != BuildMode::Check && self.worker.settings.use_substitutes {
                match self.try_substitution(&drv, &statuses).await? {
                    Substitution::Finished(result) => return Ok(result),
                    // substitution failed only for want of closure
                    // parts; realising the inputs may make those
                    // available, so try the outputs once more after
                    Substitution::IncompleteClosure if may_retry_substitution => {
                        may_retry_substitution = false;
                        retry_substitution = true;
                    }
                    Substitution::IncompleteClosure | Substitution::Build => {}
                }
            }
            if self.wanted.take_restart() {
                continue;
            }

            if !retry_substitution {
                self.wanted.note_build_started();
            }
            match self
                .realise_inputs_and_build(&drv, retry_substitution)
                .await?
            {
                InputsRealised::RetrySubstitution => {
                    debug!(drv = %self.drv_path, "inputs realised, retrying substitution");
                    continue;
                }
                InputsRealised::Done(result) => return Ok(result),
            }
        }
    }

    /// Queries where each wanted output lives and whether it is valid.
    /// Floating outputs go through the realisation registry.
    async fn check_path_validity(
        &self,
        drv: &BasicDerivation,
        wanted_names: &BTreeSet<OutputName>,
    ) -> Result<BTreeMap<OutputName, OutputStatus>, SchedulerError> {
        let store_dir = self.worker.store.store_dir();
        let static_hashes = drv.static_output_hashes(store_dir)?;
        let mut statuses = BTreeMap::new();
        for name in wanted_names {
            let path = match drv.output_path(store_dir, name)? {
                Some(path) => Some(path),
                None => {
                    let id = DrvOutput {
                        drv_hash: static_hashes[name].clone(),
                        output_name: name.clone(),
                    };
                    self.worker
                        .store
                        .query_realisation(&id)
                        .await?
                        .map(|r| r.out_path)
                }
            };
            let valid = match &path {
                Some(path) => self.worker.store.is_valid_path(path).await?,
                None => false,
            };
            let good = if valid && self.build_mode == BuildMode::Repair {
                let path = path.as_ref().ok_or_else(|| {
                    SchedulerError::Misc("valid output without a path".into())
                })?;
                self.worker.path_contents_good(path).await?
            } else {
                valid
            };
            statuses.insert(name.clone(), OutputStatus { path, valid, good });
        }
        Ok(statuses)
    }

    /// Realisations for a set of already-valid outputs, synthesizing
    /// entries for outputs that predate the registry.
    async fn collect_realisations(
        &self,
        drv: &BasicDerivation,
        statuses: &BTreeMap<OutputName, OutputStatus>,
    ) -> Result<BTreeMap<OutputName, Realisation>, SchedulerError> {
        let static_hashes = drv.static_output_hashes(self.worker.store.store_dir())?;
        let mut realisations = BTreeMap::new();
        for (name, status) in statuses {
            let Some(path) = &status.path else { continue };
            let id = DrvOutput {
                drv_hash: static_hashes[name].clone(),
                output_name: name.clone(),
            };
            let realisation = match self.worker.store.query_realisation(&id).await? {
                Some(realisation) => realisation,
                None => Realisation::new(id, path.clone()),
            };
            realisations.insert(name.clone(), realisation);
        }
        Ok(realisations)
    }

    /// Repair mode with all outputs already intact: the rest of the
    /// output closure may still be corrupt. Corrupt paths with a known
    /// deriver in the input graph are repair-built, the rest
    /// re-substituted.
    async fn repair_closure(
        &self,
        drv: &BasicDerivation,
        statuses: &BTreeMap<OutputName, OutputStatus>,
    ) -> Result<WorkResult, SchedulerError> {
        let store = &self.worker.store;
        let mut outputs = StorePathSet::new();
        let mut closure = StorePathSet::new();
        for status in statuses.values() {
            if let Some(path) = &status.path {
                outputs.insert(path.clone());
                closure.extend(store.compute_fs_closure(path).await?);
            }
        }

        let mut corrupt = Vec::new();
        for path in &closure {
            if outputs.contains(path) {
                continue;
            }
            if !self.worker.path_contents_good(path).await? {
                corrupt.push(path.clone());
            }
        }
        if !corrupt.is_empty() {
            // map closure members to the derivation that produces them
            let store_dir = store.store_dir();
            let mut outputs_to_drv: BTreeMap<StorePath, StorePath> = BTreeMap::new();
            let mut pending: Vec<StorePath> = drv.input_drvs.keys().cloned().collect();
            let mut seen = BTreeSet::new();
            while let Some(input_drv_path) = pending.pop() {
                if !seen.insert(input_drv_path.clone())
                    || !store.is_valid_path(&input_drv_path).await?
                {
                    continue;
                }
                let input_drv = store.read_derivation(&input_drv_path).await?;
                let static_hashes = input_drv.static_output_hashes(store_dir)?;
                for name in input_drv.outputs.keys() {
                    let out_path = match input_drv.output_path(store_dir, name)? {
                        Some(path) => Some(path),
                        None => {
                            let id = DrvOutput {
                                drv_hash: static_hashes[name].clone(),
                                output_name: name.clone(),
                            };
                            store.query_realisation(&id).await?.map(|r| r.out_path)
                        }
                    };
                    if let Some(out_path) = out_path {
                        outputs_to_drv.insert(out_path, input_drv_path.clone());
                    }
                }
                pending.extend(input_drv.input_drvs.keys().cloned());
            }

            let mut goals = Vec::new();
            for path in corrupt {
                match outputs_to_drv.get(&path) {
                    Some(deriver) => {
                        info!(%path, drv = %deriver, "repair-building corrupt dependency");
                        goals.push(
                            self.worker
                                .make_derivation_goal(
                                    deriver.clone(),
                                    OutputSpec::All,
                                    BuildMode::Repair,
                                )
                                .await,
                        );
                    }
                    None => {
                        info!(%path, "re-substituting corrupt dependency");
                        goals.push(self.worker.make_substitution_goal(path, true, None).await);
                    }
                }
            }
            let outcome = wait_for_goals(goals).await;
            if outcome.nr_failed > 0 {
                let mut result = BuildResult::new(BuildStatus::DependencyFailed);
                result.error_msg = Some(format!(
                    "some paths in the output closure of derivation '{}' could not be repaired",
                    self.drv_path
                ));
                return Ok(self.done(ExitCode::Failed, result));
            }
        }

        let built_outputs = self.collect_realisations(drv, statuses).await?;
        let mut result = BuildResult::new(BuildStatus::AlreadyValid);
        result.built_outputs = built_outputs;
        Ok(self.done(ExitCode::Success, result))
    }

    /// Tries to substitute every missing output. `Finished` is a
    /// terminal result; the other verdicts mean the goal should retry
    /// or proceed to building.
    async fn try_substitution(
        &self,
        drv: &BasicDerivation,
        statuses: &BTreeMap<OutputName, OutputStatus>,
    ) -> Result<Substitution, SchedulerError> {
        let ty = drv.r#type()?;
        if !ty.is_pure() {
            return Ok(Substitution::Build);
        }
        let store_dir = self.worker.store.store_dir();
        let static_hashes = drv.static_output_hashes(store_dir)?;
        let repair = self.build_mode == BuildMode::Repair;

        let mut goals = Vec::new();
        for (name, status) in statuses {
            if status.valid && status.good {
                continue;
            }
            let ca_hint = match &drv.outputs[name] {
                DerivationOutput::CAFixed(ca) => Some(ca.clone()),
                _ => None,
            };
            match &status.path {
                Some(path) => {
                    goals.push(
                        self.worker
                            .make_substitution_goal(path.clone(), repair, ca_hint)
                            .await,
                    );
                }
                None => {
                    let id = DrvOutput {
                        drv_hash: static_hashes[name].clone(),
                        output_name: name.clone(),
                    };
                    goals.push(self.worker.make_drv_output_goal(id).await);
                }
            }
        }
        if goals.is_empty() {
            return Ok(Substitution::Build);
        }
        let outcome = wait_for_goals(goals).await;

        let wanted_names: BTreeSet<OutputName> = statuses.keys().cloned().collect();
        let statuses = self.check_path_validity(drv, &wanted_names).await?;
        if statuses.values().all(|s| s.valid && s.good) {
            let built_outputs = self.collect_realisations(drv, &statuses).await?;
            let mut result = BuildResult::new(BuildStatus::Substituted);
            result.built_outputs = built_outputs;
            return Ok(Substitution::Finished(self.done(ExitCode::Success, result)));
        }
        if outcome.nr_incomplete_closure > 0 && outcome.nr_incomplete_closure == outcome.nr_failed {
            return Ok(Substitution::IncompleteClosure);
        }
        if outcome.nr_substituter_failures() > 0 && !self.worker.settings.try_fallback {
            let mut result = BuildResult::new(BuildStatus::TransientFailure);
            result.error_msg = Some(format!(
                "some substitutes for the outputs of derivation '{}' failed; \
                 try again with fallback enabled to build from source",
                self.drv_path
            ));
            return Ok(Substitution::Finished(self.done(ExitCode::Failed, result)));
        }
        Ok(Substitution::Build)
    }

    /// Realises all inputs, resolves content-addressed inputs if
    /// necessary, then builds. With `retry_substitution` it stops once
    /// the inputs are valid, handing control back for another
    /// substitution round.
    async fn realise_inputs_and_build(
        &self,
        drv: &BasicDerivation,
        retry_substitution: bool,
    ) -> Result<InputsRealised, SchedulerError> {
        let mut goals = Vec::new();
        for (input_drv, outputs) in &drv.input_drvs {
            let spec = OutputSpec::Named(outputs.clone());
            goals.push(
                self.worker
                    .make_derivation_goal(input_drv.clone(), spec, BuildMode::Normal)
                    .await,
            );
        }
        for input_src in &drv.input_srcs {
            if !self.worker.store.is_valid_path(input_src).await? {
                if !self.worker.settings.use_substitutes {
                    return Err(SchedulerError::MissingInput {
                        drv_path: self.drv_path.clone(),
                        dep: input_src.clone(),
                    });
                }
                goals.push(
                    self.worker
                        .make_substitution_goal(input_src.clone(), false, None)
                        .await,
                );
            }
        }
        let outcome = wait_for_goals(goals).await;
        if outcome.nr_failed > 0 {
            let mut result = BuildResult::new(BuildStatus::DependencyFailed);
            result.error_msg = Some(format!(
                "{} dependencies of derivation '{}' failed to build",
                outcome.nr_failed, self.drv_path
            ));
            return Ok(InputsRealised::Done(self.done(ExitCode::Failed, result)));
        }
        if retry_substitution {
            return Ok(InputsRealised::RetrySubstitution);
        }

        let ty = drv.r#type()?;
        let store_dir = self.worker.store.store_dir();

        // a pure derivation must not depend on an impure one
        let mut input_drv_map = BTreeMap::new();
        for (input_drv_path, outputs) in &drv.input_drvs {
            let input_drv = self.worker.store.read_derivation(input_drv_path).await?;
            if ty.is_pure() && !input_drv.r#type()?.is_pure() {
                return Err(SchedulerError::ImpureInput {
                    drv_path: self.drv_path.clone(),
                    input_drv: input_drv_path.clone(),
                });
            }
            let static_hashes = input_drv.static_output_hashes(store_dir)?;
            for name in outputs {
                let path = match input_drv.output_path(store_dir, name)? {
                    Some(path) => path,
                    None => {
                        let id = DrvOutput {
                            drv_hash: static_hashes[name].clone(),
                            output_name: name.clone(),
                        };
                        self.worker
                            .store
                            .query_realisation(&id)
                            .await?
                            .map(|r| r.out_path)
                            .ok_or_else(|| {
                                SchedulerError::Misc(format!(
                                    "input '{id}' of '{}' was realised but has no registered \
                                     output path",
                                    self.drv_path
                                ))
                            })?
                    }
                };
                input_drv_map.insert((input_drv_path.clone(), name.clone()), path);
            }
        }

        // derivations referring to floating inputs build under their
        // resolved form, and this goal just relabels the results
        if !drv.input_drvs.is_empty() && !ty.has_known_output_paths() {
            if let Some(resolved) = drv.try_resolve(store_dir, &input_drv_map)? {
                return Ok(InputsRealised::Done(
                    self.build_resolved(drv, resolved).await?,
                ));
            }
        }

        let mut input_paths = StorePathSet::new();
        for input_src in &drv.input_srcs {
            input_paths.extend(self.worker.store.compute_fs_closure(input_src).await?);
        }
        for path in input_drv_map.values() {
            input_paths.extend(self.worker.store.compute_fs_closure(path).await?);
        }

        Ok(InputsRealised::Done(
            self.try_to_build(drv, input_paths).await?,
        ))
    }

    /// Writes the resolved derivation, delegates to a goal for it, and
    /// re-registers its realisations under this derivation's identity.
    async fn build_resolved(
        &self,
        drv: &BasicDerivation,
        resolved: BasicDerivation,
    ) -> Result<WorkResult, SchedulerError> {
        let resolved_path = write_derivation(self.worker.store.as_ref(), &resolved).await?;
        info!(drv = %self.drv_path, resolved = %resolved_path, "building resolved derivation");
        let goal = self
            .worker
            .make_derivation_goal(resolved_path, self.wanted.current(), self.build_mode)
            .await;
        let sub_result = goal.await;
        if !sub_result.success() {
            let mut result = BuildResult::new(BuildStatus::DependencyFailed);
            result.error_msg = Some(format!(
                "resolved derivation of '{}' failed to build",
                self.drv_path
            ));
            return Ok(self.done(ExitCode::Failed, result));
        }

        let static_hashes = drv.static_output_hashes(self.worker.store.store_dir())?;
        let mut built_outputs = BTreeMap::new();
        for (name, resolved_realisation) in &sub_result.result.built_outputs {
            let id = DrvOutput {
                drv_hash: static_hashes[name].clone(),
                output_name: name.clone(),
            };
            let mut realisation = Realisation::new(id, resolved_realisation.out_path.clone());
            realisation.dependent_realisations =
                resolved_realisation.dependent_realisations.clone();
            self.worker.store.register_drv_output(&realisation).await?;
            built_outputs.insert(name.clone(), realisation);
        }

        let status = match sub_result.result.status {
            BuildStatus::AlreadyValid => BuildStatus::ResolvesToAlreadyValid,
            status => status,
        };
        let mut result = BuildResult::new(status);
        result.built_outputs = built_outputs;
        result.times_built = sub_result.result.times_built;
        Ok(self.done(ExitCode::Success, result))
    }

    async fn try_to_build(
        &self,
        drv: &BasicDerivation,
        input_paths: StorePathSet,
    ) -> Result<WorkResult, SchedulerError> {
        let store_dir = self.worker.store.store_dir();
        let mut lock_paths: Vec<StorePath> = drv
            .outputs
            .keys()
            .filter_map(|name| drv.output_path(store_dir, name).ok().flatten())
            .collect();
        if lock_paths.is_empty() {
            // floating outputs have no paths yet; the derivation path
            // itself serializes concurrent builds of the same drv
            lock_paths.push(self.drv_path.clone());
        }

        // other processes building the same outputs are excluded by
        // lock files; a bounded poll replaces blocking acquisition
        let _locks = match self.worker.store.lock_root() {
            Some(lock_root) => {
                let mut attempt = 0;
                loop {
                    match PathLocks::try_lock(lock_root, lock_paths.iter()).await? {
                        Some(locks) => break Some(locks),
                        None => {
                            attempt += 1;
                            if attempt >= self.worker.settings.max_lock_retries {
                                return Err(SchedulerError::LockTimeout(
                                    lock_root.to_path_buf(),
                                    attempt,
                                ));
                            }
                            tokio::time::sleep(self.worker.settings.lock_poll_interval).await;
                        }
                    }
                }
            }
            _ => None,
        };

        // now that we hold the locks, another process may have finished
        // these outputs while we were waiting
        if self.build_mode == BuildMode::Normal {
            let wanted_names = drv.wanted_output_names(&self.wanted.current())?;
            let statuses = self.check_path_validity(drv, &wanted_names).await?;
            if statuses.values().all(|s| s.valid && s.good) {
                let built_outputs = self.collect_realisations(drv, &statuses).await?;
                let mut result = BuildResult::new(BuildStatus::AlreadyValid);
                result.built_outputs = built_outputs;
                return Ok(self.done(ExitCode::Success, result));
            }
        }

        let can_build_locally = self.worker.settings.max_build_jobs > 0
            && (drv.platform == self.worker.settings.system || drv.platform == "builtin")
            && required_features(drv).is_subset(&self.worker.settings.system_features);

        if self.build_mode == BuildMode::Normal {
            if let Some(outcome) = self.try_hook(drv, &input_paths, can_build_locally).await? {
                return self.finish_remote_build(drv, outcome).await;
            }
        }
        if !can_build_locally {
            let mut result = BuildResult::new(BuildStatus::PermanentFailure);
            result.error_msg = Some(if self.worker.settings.max_build_jobs == 0 {
                SchedulerError::NoBuildSlots.to_string()
            } else {
                format!(
                    "a machine of type '{}' with features {:?} is required to build '{}', \
                     but this is a '{}' machine",
                    drv.platform,
                    required_features(drv),
                    self.drv_path,
                    self.worker.settings.system
                )
            });
            let mut work = self.done(ExitCode::Failed, result);
            work.permanent_failure = true;
            return Ok(work);
        }

        let lease = self.worker.counters.expect_build();
        let _permit = self
            .worker
            .build_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| SchedulerError::Misc(format!("build slots closed: {e}")))?;
        let _running = self.worker.counters.running_build();
        info!(drv = %self.drv_path, "building locally");

        let output_scaffold: BTreeMap<OutputName, String> = drv
            .outputs
            .keys()
            .map(|name| {
                let rendered = match drv.output_path(store_dir, name).ok().flatten() {
                    Some(path) => store_dir.display_path(&path),
                    None => hash_placeholder(name),
                };
                (name.clone(), rendered)
            })
            .collect();
        let limits = BuildLimits {
            build_timeout: self.worker.settings.build_timeout,
            max_silent_time: self.worker.settings.max_silent_time,
            max_log_size: self.worker.settings.max_log_size,
            log_tail_lines: self.worker.settings.log_tail_lines,
        };
        let start_time = unix_now();
        let outcome = self
            .worker
            .builder
            .build(BuildContext {
                store_dir,
                drv_path: &self.drv_path,
                drv,
                output_paths: &output_scaffold,
                input_paths: &input_paths,
                limits: &limits,
            })
            .await?;
        let stop_time = unix_now();

        match outcome {
            BuildOutcome::Success { outputs } => {
                let mut work = self
                    .register_outputs(drv, outputs, start_time, stop_time)
                    .await?;
                if work.success() {
                    lease.done();
                    if let Err(e) = self.run_post_build_hook(&work).await {
                        mark_post_hook_failure(&mut work, e);
                    }
                } else {
                    lease.failed();
                }
                Ok(work)
            }
            BuildOutcome::Failure { reason, log_tail } => {
                lease.failed();
                Ok(self.classify_build_failure(drv, reason, log_tail, start_time, stop_time)?)
            }
        }
    }

    /// Offers the build to the hook. `Ok(None)` means build locally.
    async fn try_hook(
        &self,
        drv: &BasicDerivation,
        input_paths: &StorePathSet,
        can_build_locally: bool,
    ) -> Result<Option<HookBuildOutcome>, SchedulerError> {
        let Some(program) = self.worker.settings.build_hook.clone() else {
            return Ok(None);
        };
        let features = required_features(drv);
        let mut postponed_once = false;
        loop {
            let mut state = self.worker.hook.lock().await;
            if state.disabled {
                return Ok(None);
            }
            let mut instance = match state.idle.take() {
                Some(instance) => instance,
                None => HookInstance::start(&program).await?,
            };
            let reply = instance
                .offer(can_build_locally, &drv.platform, &self.drv_path, &features)
                .await?;
            match reply {
                HookReply::Accept { machine } => {
                    drop(state);
                    let _permit = self
                        .worker
                        .hook_slots
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| SchedulerError::Misc(format!("hook slots closed: {e}")))?;
                    info!(drv = %self.drv_path, %machine, "building via hook");
                    let wanted_names = drv.wanted_output_names(&self.wanted.current())?;
                    let outcome = instance
                        .run_build(
                            &self.drv_path,
                            drv,
                            input_paths,
                            &wanted_names,
                            self.worker.settings.log_tail_lines,
                        )
                        .await?;
                    return Ok(Some(outcome));
                }
                HookReply::Decline => {
                    state.idle = Some(instance);
                    return Ok(None);
                }
                HookReply::DeclinePermanently => {
                    state.disabled = true;
                    return Ok(None);
                }
                HookReply::Postpone => {
                    state.idle = Some(instance);
                    drop(state);
                    if postponed_once || !can_build_locally {
                        return Ok(None);
                    }
                    // all remote slots busy; ask once more after a local
                    // slot frees up, then fall back to building here
                    postponed_once = true;
                    let permit = self
                        .worker
                        .build_slots
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| SchedulerError::Misc(format!("build slots closed: {e}")))?;
                    drop(permit);
                }
            }
        }
    }

    /// After a hook claims success, the outputs must actually be valid
    /// here; then registration mirrors a local build.
    async fn finish_remote_build(
        &self,
        drv: &BasicDerivation,
        outcome: HookBuildOutcome,
    ) -> Result<WorkResult, SchedulerError> {
        match outcome {
            HookBuildOutcome::Success => {
                let wanted_names = drv.wanted_output_names(&self.wanted.current())?;
                let statuses = self.check_path_validity(drv, &wanted_names).await?;
                for (name, status) in &statuses {
                    if !status.valid {
                        return Err(SchedulerError::Hook(format!(
                            "hook reported success but output '{name}' of '{}' is not valid",
                            self.drv_path
                        )));
                    }
                    if let Some(path) = &status.path {
                        self.worker.mark_contents_good(path.clone()).await;
                    }
                }
                let built_outputs = self.collect_realisations(drv, &statuses).await?;
                for realisation in built_outputs.values() {
                    self.worker.store.register_drv_output(realisation).await?;
                }
                let mut result = BuildResult::new(BuildStatus::Built);
                result.times_built = 1;
                result.built_outputs = built_outputs;
                Ok(self.done(ExitCode::Success, result))
            }
            HookBuildOutcome::Failure { reason, log_tail } => {
                let now = unix_now();
                self.classify_build_failure(drv, reason, log_tail, now, now)
            }
        }
    }

    fn classify_build_failure(
        &self,
        drv: &BasicDerivation,
        reason: FailureReason,
        log_tail: Vec<String>,
        start_time: u64,
        stop_time: u64,
    ) -> Result<WorkResult, SchedulerError> {
        let sandboxed = drv.r#type()?.is_sandboxed();
        let (status, detail) = match reason {
            FailureReason::TimedOut => (BuildStatus::TimedOut, "timed out".to_string()),
            FailureReason::LogLimitExceeded => (
                BuildStatus::LogLimitExceeded,
                "exceeded the build log size limit".to_string(),
            ),
            FailureReason::DiskFull => (
                BuildStatus::TransientFailure,
                "ran out of disk space".to_string(),
            ),
            FailureReason::Exit(code) => {
                let status = if sandboxed {
                    BuildStatus::PermanentFailure
                } else {
                    // unsandboxed builds see the network; their
                    // failures may succeed on retry
                    BuildStatus::TransientFailure
                };
                (status, format!("builder failed with exit code {code}"))
            }
        };
        let mut error = format!("builder for '{}' {detail}", self.drv_path);
        if !log_tail.is_empty() {
            error.push_str("; last log lines:\n  ");
            error.push_str(&log_tail.join("\n  "));
        }
        let mut result = BuildResult::new(status);
        result.error_msg = Some(error);
        result.times_built = 1;
        result.start_time = start_time;
        result.stop_time = stop_time;
        let mut work = self.done(ExitCode::Failed, result);
        work.permanent_failure = status == BuildStatus::PermanentFailure;
        work.timed_out = status == BuildStatus::TimedOut;
        Ok(work)
    }

    /// Turns builder artifacts into registered store objects and
    /// realisations. Fixed outputs are checked against their declared
    /// hash; check mode compares against the previous build instead of
    /// registering.
    async fn register_outputs(
        &self,
        drv: &BasicDerivation,
        outputs: BTreeMap<OutputName, BuiltOutput>,
        start_time: u64,
        stop_time: u64,
    ) -> Result<WorkResult, SchedulerError> {
        let store_dir = self.worker.store.store_dir();
        let ty = drv.r#type()?;
        let repair = self.build_mode == BuildMode::Repair;

        let mut final_paths: BTreeMap<OutputName, (StorePath, BuiltOutput, Option<ContentAddress>)> =
            BTreeMap::new();
        for (name, output_decl) in &drv.outputs {
            let Some(built) = outputs.get(name) else {
                let mut result = BuildResult::new(BuildStatus::OutputRejected);
                result.error_msg = Some(format!(
                    "builder for '{}' failed to produce output '{name}'",
                    self.drv_path
                ));
                let mut work = self.done(ExitCode::Failed, result);
                work.permanent_failure = true;
                return Ok(work);
            };
            let (path, ca) = match output_decl {
                DerivationOutput::InputAddressed(path) => (path.clone(), None),
                DerivationOutput::CAFixed(ca) => {
                    let got = content_hash(&built.contents, ca.hash.algo);
                    if got != ca.hash {
                        let mut result = BuildResult::new(BuildStatus::OutputRejected);
                        result.error_msg = Some(format!(
                            "hash mismatch in fixed-output derivation '{}':\n  specified: {}\n  \
                             got:       {}",
                            self.drv_path, ca.hash, got
                        ));
                        let mut work = self.done(ExitCode::Failed, result);
                        work.hash_mismatch = true;
                        work.permanent_failure = true;
                        return Ok(work);
                    }
                    let path = drv.output_path(store_dir, name)?.ok_or_else(|| {
                        SchedulerError::Misc("fixed output without a static path".into())
                    })?;
                    (path, Some(ca.clone()))
                }
                DerivationOutput::CAFloating { method, hash_algo }
                | DerivationOutput::Impure { method, hash_algo } => {
                    let ca = ContentAddress {
                        method: *method,
                        hash: content_hash(&built.contents, *hash_algo),
                    };
                    let path_name = output_path_name(drv, name)?;
                    (store_dir.make_store_path_from_ca(&path_name, &ca), Some(ca))
                }
                DerivationOutput::Deferred => {
                    return Err(SchedulerError::Misc(format!(
                        "derivation '{}' still has a deferred output after resolution",
                        self.drv_path
                    )));
                }
            };
            final_paths.insert(name.clone(), (path, built.clone(), ca));
        }

        if self.build_mode == BuildMode::Check {
            return self.compare_check_build(&final_paths, start_time, stop_time).await;
        }

        let static_hashes = drv.static_output_hashes(store_dir)?;
        let mut built_outputs = BTreeMap::new();
        for (name, (path, built, ca)) in final_paths {
            let mut info = cadenza_store::PathInfo::new(
                path.clone(),
                Hash::sha256_of(&built.contents),
                built.contents.len() as u64,
            );
            info.references = built.references.clone();
            info.deriver = Some(self.drv_path.clone());
            info.ca = ca;
            info.ultimate = true;
            info.registration_time = stop_time;
            self.worker
                .store
                .add_to_store(info, built.contents, repair)
                .await?;
            self.worker.mark_contents_good(path.clone()).await;

            if ty.is_pure() {
                let realisation = Realisation::new(
                    DrvOutput {
                        drv_hash: static_hashes[&name].clone(),
                        output_name: name.clone(),
                    },
                    path,
                );
                self.worker.store.register_drv_output(&realisation).await?;
                built_outputs.insert(name, realisation);
            }
        }

        let mut result = BuildResult::new(BuildStatus::Built);
        result.times_built = 1;
        result.start_time = start_time;
        result.stop_time = stop_time;
        result.built_outputs = built_outputs;
        Ok(self.done(ExitCode::Success, result))
    }

    /// Check mode: rebuild and compare, never register.
    async fn compare_check_build(
        &self,
        final_paths: &BTreeMap<OutputName, (StorePath, BuiltOutput, Option<ContentAddress>)>,
        start_time: u64,
        stop_time: u64,
    ) -> Result<WorkResult, SchedulerError> {
        let mut mismatched = Vec::new();
        for (name, (path, built, _)) in final_paths {
            // a determinism check needs something to compare against
            let previous = self
                .worker
                .store
                .query_path_info(path)
                .await?
                .ok_or_else(|| SchedulerError::CheckNotPossible(self.drv_path.clone()))?;
            if previous.nar_hash != Hash::sha256_of(&built.contents) {
                mismatched.push((name.clone(), path.clone()));
            }
        }
        if mismatched.is_empty() {
            let mut result = BuildResult::new(BuildStatus::Built);
            result.times_built = 1;
            result.start_time = start_time;
            result.stop_time = stop_time;
            return Ok(self.done(ExitCode::Success, result));
        }
        let mut result = BuildResult::new(BuildStatus::NotDeterministic);
        result.is_non_deterministic = true;
        result.times_built = 1;
        result.start_time = start_time;
        result.stop_time = stop_time;
        result.error_msg = Some(format!(
            "derivation '{}' may not be deterministic: outputs {} differ from the previous build",
            self.drv_path,
            mismatched
                .iter()
                .map(|(name, _)| format!("'{name}'"))
                .collect::<Vec<_>>()
                .join(", ")
        ));
        let mut work = self.done(ExitCode::Failed, result);
        work.check_mismatch = true;
        Ok(work)
    }

    /// Runs the configured post-build hook with the derivation and its
    /// output paths in the environment. A failing hook fails the build.
    async fn run_post_build_hook(&self, work: &WorkResult) -> Result<(), SchedulerError> {
        let Some(program) = &self.worker.settings.post_build_hook else {
            return Ok(());
        };
        let store_dir = self.worker.store.store_dir();
        let out_paths: Vec<String> = work
            .result
            .built_outputs
            .values()
            .map(|r| store_dir.display_path(&r.out_path))
            .collect();
        info!(drv = %self.drv_path, hook = %program.display(), "running post-build hook");
        let output = tokio::process::Command::new(program)
            .env("DRV_PATH", store_dir.display_path(&self.drv_path))
            .env("OUT_PATHS", out_paths.join(" "))
            .output()
            .await
            .map_err(|e| SchedulerError::Misc(format!("cannot run post-build hook: {e}")))?;
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            info!(target: "post-build-hook", "{line}");
        }
        if !output.status.success() {
            return Err(SchedulerError::Misc(format!(
                "post-build hook for '{}' failed with {}",
                self.drv_path, output.status
            )));
        }
        Ok(())
    }
}

fn mark_post_hook_failure(work: &mut WorkResult, e: SchedulerError) {
    warn!("{e}");
    work.exit_code = ExitCode::Failed;
    work.result.status = BuildStatus::MiscFailure;
    work.result.error_msg = Some(e.to_string());
    work.error = work.result.error_msg.clone();
}

/// Extra machine features the derivation declares it needs.
fn required_features(drv: &BasicDerivation) -> BTreeSet<String> {
    drv.env
        .get("requiredSystemFeatures")
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// The store path name of one output: the derivation name, suffixed for
/// outputs other than `out`.
fn output_path_name(
    drv: &BasicDerivation,
    output: &OutputName,
) -> Result<cadenza_store_core::StorePathName, SchedulerError> {
    let name = if output.is_default() {
        drv.name.to_string()
    } else {
        format!("{}-{}", drv.name, output)
    };
    name.parse()
        .map_err(|e| SchedulerError::Misc(format!("bad output path name: {e}")))
}

fn content_hash(contents: &[u8], algo: cadenza_store_core::HashAlgo) -> Hash {
    match algo {
        cadenza_store_core::HashAlgo::Sha512 => Hash::sha512_of(contents),
        _ => Hash::sha256_of(contents),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
