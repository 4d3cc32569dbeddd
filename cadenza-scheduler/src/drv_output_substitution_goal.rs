// SPDX-License-Identifier: MIT

//! Substituting one content-addressed derivation output.
//!
//! For a floating output the store path is unknown until somebody has
//! built it, so substitution goes through the realisation registry: ask
//! each substituter which path the output resolved to, fetch that path
//! (and the realisations it depends on), then register the realisation
//! locally.

use std::sync::Arc;

use cadenza_store::StoreError;
use cadenza_store_core::{BuildResult, BuildStatus, DrvOutput, Realisation};
use futures::FutureExt as _;
use tracing::{debug, warn};

use crate::goal::{ExitCode, GoalFuture, WorkResult, wait_for_goals};
use crate::worker::{Worker, spawn_goal};

pub(crate) fn spawn(worker: Arc<Worker>, id: DrvOutput) -> GoalFuture {
    spawn_goal(
        async move {
            let result = run(&worker, &id).await;
            worker.note_result(&result);
            result
        }
        .boxed(),
    )
}

async fn run(worker: &Arc<Worker>, id: &DrvOutput) -> WorkResult {
    match substitute(worker, id).await {
        Ok(result) => result,
        Err(e) => {
            let mut build = BuildResult::new(BuildStatus::MiscFailure);
            build.error_msg = Some(e.to_string());
            finish(ExitCode::Failed, build)
        }
    }
}

fn finish(exit_code: ExitCode, result: BuildResult) -> WorkResult {
    let mut work = WorkResult::new(exit_code, result);
    work.error = work.result.error_msg.clone();
    work
}

async fn substitute(worker: &Arc<Worker>, id: &DrvOutput) -> Result<WorkResult, StoreError> {
    if let Some(known) = worker.store.query_realisation(id).await? {
        if worker.store.is_valid_path(&known.out_path).await? {
            return Ok(finish(
                ExitCode::Success,
                BuildResult::new(BuildStatus::AlreadyValid),
            ));
        }
    }

    let mut substituter_failed = false;
    for sub in &worker.substituters {
        let realisation = match sub.query_realisation(id).await {
            Ok(Some(realisation)) => realisation,
            Ok(None) => continue,
            Err(e) => {
                warn!(sub = %sub.uri(), id = %id, "realisation query failed: {e}");
                continue;
            }
        };
        if let Some(conflict) = conflicting_local_realisation(worker, &realisation).await? {
            warn!(
                sub = %sub.uri(),
                id = %id,
                "ignoring substituted realisation: dependency '{}' resolves differently here",
                conflict
            );
            continue;
        }

        // the output path itself plus the realisations it was built from
        let mut dependency_goals = vec![
            worker
                .make_substitution_goal(realisation.out_path.clone(), false, None)
                .await,
        ];
        for dep_id in realisation.dependent_realisations.keys() {
            dependency_goals.push(worker.make_drv_output_goal(dep_id.clone()).await);
        }
        let outcome = wait_for_goals(dependency_goals).await;
        if outcome.nr_failed > 0 {
            debug!(id = %id, "substituted realisation's closure failed, trying next");
            substituter_failed = true;
            continue;
        }

        worker.store.register_drv_output(&realisation).await?;
        return Ok(finish(
            ExitCode::Success,
            BuildResult::new(BuildStatus::Substituted),
        ));
    }

    let mut result = BuildResult::new(BuildStatus::NoSubstituters);
    result.error_msg = Some(format!(
        "derivation output '{id}' is required, but there is no substituter that can provide it"
    ));
    let exit_code = if substituter_failed {
        ExitCode::Failed
    } else {
        ExitCode::NoSubstituters
    };
    Ok(finish(exit_code, result))
}

/// A substituted realisation is only acceptable if the realisations it
/// depends on agree with what this store has already registered.
async fn conflicting_local_realisation(
    worker: &Arc<Worker>,
    candidate: &Realisation,
) -> Result<Option<DrvOutput>, StoreError> {
    for (dep_id, dep_path) in &candidate.dependent_realisations {
        if let Some(local) = worker.store.query_realisation(dep_id).await? {
            if &local.out_path != dep_path {
                return Ok(Some(dep_id.clone()));
            }
        }
    }
    Ok(None)
}
