// SPDX-License-Identifier: MIT

//! The external build hook.
//!
//! The hook is a long-lived subprocess that can farm builds out to
//! remote machines. The scheduler offers it each derivation it is about
//! to build locally; the hook answers with one line on stdout:
//!
//! ```text
//! # accept <machine>
//! # decline
//! # decline-permanently
//! # postpone
//! ```
//!
//! Lines not starting with `# ` are diagnostics and are logged as-is.
//! After `accept` the scheduler hands over the build and waits for the
//! hook to exit: 0 means the outputs are now valid in the store, 100 is
//! a permanent build failure, 101 a timeout, anything else a transient
//! failure.

use std::collections::BTreeSet;
use std::process::Stdio;

use cadenza_store_core::store_path::StorePathSet;
use cadenza_store_core::{BasicDerivation, OutputName, StorePath};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tracing::{debug, info};

use crate::builder::FailureReason;
use crate::error::SchedulerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HookReply {
    /// The hook will run this build, on the named machine.
    Accept { machine: String },
    /// The hook cannot take this build right now.
    Decline,
    /// The hook will not take any build for the rest of this session.
    DeclinePermanently,
    /// All remote slots are busy; ask again once a local slot is free.
    Postpone,
}

#[derive(Debug)]
pub(crate) enum HookBuildOutcome {
    Success,
    Failure {
        reason: FailureReason,
        log_tail: Vec<String>,
    },
}

pub(crate) struct HookInstance {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl HookInstance {
    pub(crate) async fn start(program: &std::path::Path) -> Result<Self, SchedulerError> {
        debug!(program = %program.display(), "starting build hook");
        let mut child = tokio::process::Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SchedulerError::Hook(format!("cannot start '{}': {e}", program.display()))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SchedulerError::Hook("hook stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SchedulerError::Hook("hook stdout not captured".into()))?;
        Ok(HookInstance {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    /// Offers one derivation to the hook and reads its verdict.
    /// `am_willing` says whether this scheduler could also build the
    /// derivation locally.
    pub(crate) async fn offer(
        &mut self,
        am_willing: bool,
        platform: &str,
        drv_path: &StorePath,
        required_features: &BTreeSet<String>,
    ) -> Result<HookReply, SchedulerError> {
        let mut line = format!(
            "try {} {} {}",
            if am_willing { 1 } else { 0 },
            platform,
            drv_path
        );
        for feature in required_features {
            line.push(' ');
            line.push_str(feature);
        }
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SchedulerError::Hook(format!("cannot write to hook: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| SchedulerError::Hook(format!("cannot write to hook: {e}")))?;

        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| SchedulerError::Hook(format!("cannot read from hook: {e}")))?
                .ok_or_else(|| SchedulerError::Hook("hook closed its stdout".into()))?;
            match line.strip_prefix("# ") {
                Some(rest) => {
                    let mut words = rest.split_whitespace();
                    match words.next() {
                        Some("decline") => return Ok(HookReply::Decline),
                        Some("decline-permanently") => return Ok(HookReply::DeclinePermanently),
                        Some("postpone") => return Ok(HookReply::Postpone),
                        Some("accept") => {
                            return Ok(HookReply::Accept {
                                machine: words.next().unwrap_or_default().to_string(),
                            });
                        }
                        _ => {
                            return Err(SchedulerError::Hook(format!(
                                "unexpected hook reply '{line}'"
                            )));
                        }
                    }
                }
                None => info!(target: "hook", "{line}"),
            }
        }
    }

    /// Hands an accepted build to the hook and waits for it to finish.
    /// The hook is responsible for making the wanted outputs valid in
    /// the local store before exiting 0.
    pub(crate) async fn run_build(
        mut self,
        drv_path: &StorePath,
        drv: &BasicDerivation,
        inputs: &StorePathSet,
        wanted: &BTreeSet<OutputName>,
        log_tail_lines: usize,
    ) -> Result<HookBuildOutcome, SchedulerError> {
        let header = serde_json::json!({
            "drvPath": drv_path.to_string(),
            "derivation": drv,
            "inputs": inputs.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
            "wantedOutputs": wanted.iter().map(|o| o.to_string()).collect::<Vec<_>>(),
        });
        let mut line =
            serde_json::to_string(&header).map_err(|e| SchedulerError::Hook(e.to_string()))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SchedulerError::Hook(format!("cannot write to hook: {e}")))?;
        // EOF on stdin tells the hook the hand-off is complete.
        drop(self.stdin);

        let mut tail = std::collections::VecDeque::new();
        while let Some(line) = self
            .stdout
            .next_line()
            .await
            .map_err(|e| SchedulerError::Hook(format!("cannot read from hook: {e}")))?
        {
            info!(target: "hook", "{line}");
            if tail.len() == log_tail_lines {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| SchedulerError::Hook(format!("cannot wait for hook: {e}")))?;
        let log_tail: Vec<String> = tail.into();
        Ok(match status.code() {
            Some(0) => HookBuildOutcome::Success,
            Some(100) => HookBuildOutcome::Failure {
                reason: FailureReason::Exit(100),
                log_tail,
            },
            Some(101) => HookBuildOutcome::Failure {
                reason: FailureReason::TimedOut,
                log_tail,
            },
            code => HookBuildOutcome::Failure {
                reason: FailureReason::Exit(code.unwrap_or(-1)),
                log_tail,
            },
        })
    }
}

/// What the worker remembers about the hook across builds.
#[derive(Default)]
pub(crate) struct HookState {
    /// Cleared after a `decline-permanently`.
    pub(crate) disabled: bool,
    /// A started instance waiting for its next offer.
    pub(crate) idle: Option<HookInstance>,
}
