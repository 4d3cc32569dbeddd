// SPDX-License-Identifier: MIT

//! Making one store path valid by fetching it from a substituter.
//!
//! Substituters are tried in preference order. For each candidate the
//! goal first realises the path's references (the closure invariant:
//! a path is only registered once everything it points to is valid),
//! then takes a transfer slot and copies the object in. A substituter
//! that merely does not have the path is skipped silently; one that
//! advertised the path and then failed marks the whole goal as a real
//! failure rather than plain unavailability.

use std::sync::Arc;

use cadenza_store::{Store, StoreError, copy_store_path};
use cadenza_store_core::{BuildResult, BuildStatus, ContentAddress, StorePath};
use futures::FutureExt as _;
use tracing::{debug, info, warn};

use crate::goal::{ExitCode, GoalFuture, WorkResult, wait_for_goals};
use crate::worker::{Worker, spawn_goal};

pub(crate) fn spawn(
    worker: Arc<Worker>,
    path: StorePath,
    repair: bool,
    ca: Option<ContentAddress>,
) -> GoalFuture {
    spawn_goal(
        async move {
            let result = run(&worker, &path, repair, ca).await;
            worker.note_result(&result);
            result
        }
        .boxed(),
    )
}

async fn run(worker: &Arc<Worker>, path: &StorePath, repair: bool, ca: Option<ContentAddress>) -> WorkResult {
    match substitute(worker, path, repair, ca).await {
        Ok(result) => result,
        Err(e) => {
            let mut build = BuildResult::new(BuildStatus::MiscFailure);
            build.error_msg = Some(e.to_string());
            finish(path, ExitCode::Failed, build)
        }
    }
}

fn finish(path: &StorePath, exit_code: ExitCode, result: BuildResult) -> WorkResult {
    let mut work = WorkResult::new(exit_code, result);
    work.error = work.result.error_msg.clone();
    work.path = Some(path.clone());
    work
}

async fn substitute(
    worker: &Arc<Worker>,
    path: &StorePath,
    repair: bool,
    ca: Option<ContentAddress>,
) -> Result<WorkResult, StoreError> {
    if !repair && worker.store.is_valid_path(path).await? {
        return Ok(finish(
            path,
            ExitCode::Success,
            BuildResult::new(BuildStatus::AlreadyValid),
        ));
    }
    if !worker.settings.use_substitutes {
        let mut result = BuildResult::new(BuildStatus::NoSubstituters);
        result.error_msg = Some(format!(
            "path '{}' is required, but substitution is disabled",
            worker.store.store_dir().display_path(path)
        ));
        return Ok(finish(path, ExitCode::NoSubstituters, result));
    }

    let our_dir = worker.store.store_dir();
    let mut substituter_failed = false;

    for sub in &worker.substituters {
        // a substituter with a different store prefix can only serve
        // self-contained content-addressed objects, at a recomputed path
        let sub_path = if sub.store_dir() == our_dir {
            path.clone()
        } else if let Some(ca) = &ca {
            sub.store_dir().make_store_path_from_ca(path.name(), ca)
        } else {
            debug!(sub = %sub.uri(), "store prefix differs, skipping");
            continue;
        };

        let info = match sub.query_path_info(&sub_path).await {
            Ok(Some(info)) => info,
            Ok(None) => continue,
            Err(e) => {
                warn!(sub = %sub.uri(), path = %sub_path, "substituter query failed: {e}");
                continue;
            }
        };
        if info.path != sub_path {
            warn!(sub = %sub.uri(), "substituter returned info for the wrong path");
            continue;
        }
        if worker.store.requires_sigs()
            && !sub.is_trusted()
            && !info.is_trustworthy(worker.store.trusted_keys())
        {
            warn!(
                sub = %sub.uri(),
                path = %sub_path,
                "ignoring substitute without a valid signature"
            );
            continue;
        }

        let lease = worker
            .counters
            .expect_substitution(info.nar_size, info.nar_size);

        // the closure invariant: references first
        let mut reference_goals = Vec::new();
        for reference in &info.references {
            if reference == path {
                continue;
            }
            if !worker.store.is_valid_path(reference).await? {
                reference_goals.push(
                    worker
                        .make_substitution_goal(reference.clone(), false, None)
                        .await,
                );
            }
        }
        let outcome = wait_for_goals(reference_goals).await;
        if outcome.nr_failed > 0 {
            let exit_code = if outcome.nr_no_substituters + outcome.nr_incomplete_closure > 0 {
                ExitCode::IncompleteClosure
            } else {
                ExitCode::Failed
            };
            let mut result = BuildResult::new(BuildStatus::DependencyFailed);
            result.error_msg = Some(format!(
                "some references of path '{}' could not be realised",
                our_dir.display_path(path)
            ));
            return Ok(finish(path, exit_code, result));
        }

        let _permit = worker
            .substitution_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| StoreError::Misc(format!("substitution slots closed: {e}")))?;
        let _running = worker.counters.running_substitution();
        info!(path = %path, sub = %sub.uri(), "substituting");

        let copied = if sub.store_dir() == our_dir {
            copy_store_path(sub.as_ref(), worker.store.as_ref(), &sub_path, repair, true)
                .await
                .map(|_| ())
        } else {
            copy_foreign_ca_object(worker, sub.as_ref(), &sub_path, path, repair).await
        };
        match copied {
            Ok(()) => {
                worker.store.add_temp_root(path).await?;
                worker.mark_contents_good(path.clone()).await;
                lease.done();
                return Ok(finish(
                    path,
                    ExitCode::Success,
                    BuildResult::new(BuildStatus::Substituted),
                ));
            }
            Err(StoreError::SubstituteGone(_)) => {
                // advertised but gone; not the substituter's fault
                warn!(sub = %sub.uri(), path = %sub_path, "substitute vanished, trying next");
                lease.failed();
            }
            Err(e) => {
                warn!(sub = %sub.uri(), path = %sub_path, "substitution failed: {e}");
                substituter_failed = true;
                lease.failed();
            }
        }
    }

    let mut result = BuildResult::new(BuildStatus::NoSubstituters);
    result.error_msg = Some(format!(
        "path '{}' is required, but there is no substituter that can build it",
        our_dir.display_path(path)
    ));
    let exit_code = if substituter_failed {
        ExitCode::Failed
    } else {
        ExitCode::NoSubstituters
    };
    Ok(finish(path, exit_code, result))
}

/// Imports a self-contained content-addressed object from a store with
/// a different prefix, re-registering it under our path.
async fn copy_foreign_ca_object(
    worker: &Arc<Worker>,
    sub: &dyn Store,
    sub_path: &StorePath,
    our_path: &StorePath,
    repair: bool,
) -> Result<(), StoreError> {
    let (mut info, contents) = sub.export_path(sub_path).await?;
    if !info.references.is_empty() {
        return Err(StoreError::Misc(format!(
            "cannot import '{sub_path}' from a foreign store prefix: it has references"
        )));
    }
    info.path = our_path.clone();
    info.sigs.clear();
    worker.store.add_to_store(info, contents, repair).await
}
