// SPDX-License-Identifier: MIT

//! The local build boundary.
//!
//! The scheduler hands a fully prepared derivation to a
//! [`DerivationBuilder`] and gets back either per-output artifacts or a
//! structured failure. Sandboxing is the implementation's business;
//! [`ProcessBuilder`] is a plain subprocess runner for embedders without
//! one, and tests use scripted implementations.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cadenza_store_core::store_path::StorePathSet;
use cadenza_store_core::{BasicDerivation, OutputName, StoreDir, StorePath};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SchedulerError;

/// One produced output, before registration.
#[derive(Debug, Clone)]
pub struct BuiltOutput {
    pub contents: Bytes,
    pub references: StorePathSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The builder exited nonzero (or died to a signal, reported as
    /// negative).
    Exit(i32),
    /// Wall-clock or silence limit exceeded.
    TimedOut,
    LogLimitExceeded,
    /// The build failed because the disk filled up.
    DiskFull,
}

#[derive(Debug, Clone)]
pub enum BuildOutcome {
    Success {
        outputs: BTreeMap<OutputName, BuiltOutput>,
    },
    Failure {
        reason: FailureReason,
        log_tail: Vec<String>,
    },
}

/// Resource limits for one build.
#[derive(Debug, Clone)]
pub struct BuildLimits {
    pub build_timeout: Option<Duration>,
    pub max_silent_time: Option<Duration>,
    pub max_log_size: u64,
    pub log_tail_lines: usize,
}

/// Everything a builder needs about the build it is asked to run.
pub struct BuildContext<'a> {
    pub store_dir: &'a StoreDir,
    pub drv_path: &'a StorePath,
    pub drv: &'a BasicDerivation,
    /// Per output: the rendered store path when known up front, or the
    /// placeholder the builder must use for it.
    pub output_paths: &'a BTreeMap<OutputName, String>,
    /// The closure of all build inputs.
    pub input_paths: &'a StorePathSet,
    pub limits: &'a BuildLimits,
}

#[async_trait]
pub trait DerivationBuilder: Send + Sync {
    async fn build(&self, ctx: BuildContext<'_>) -> Result<BuildOutcome, SchedulerError>;
}

/// Runs `drv.builder` directly as a subprocess, with each output
/// pointing at a scratch file whose contents become the output artifact.
/// No isolation; builds that need a sandbox want a different
/// implementation behind the same trait.
pub struct ProcessBuilder;

#[async_trait]
impl DerivationBuilder for ProcessBuilder {
    async fn build(&self, ctx: BuildContext<'_>) -> Result<BuildOutcome, SchedulerError> {
        let scratch = tempfile::tempdir()?;
        let mut out_files = BTreeMap::new();
        let mut command = tokio::process::Command::new(&ctx.drv.builder);
        command
            .args(&ctx.drv.args)
            .env_clear()
            .envs(&ctx.drv.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for output_name in ctx.drv.outputs.keys() {
            let file = scratch.path().join(output_name.as_str());
            command.env(output_name.as_str(), &file);
            out_files.insert(output_name.clone(), file);
        }
        debug!(drv = %ctx.drv_path, builder = %ctx.drv.builder, "starting builder");

        let mut child = command.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut log = LogSink::new(ctx.limits);
        let mut lines = merged_lines(stdout, stderr);

        let started = Instant::now();
        let deadline = ctx.limits.build_timeout.map(|limit| started + limit);
        let reason = loop {
            // the nearest of the silence window and the wall-clock deadline
            let wake_at = match (ctx.limits.max_silent_time, deadline) {
                (Some(silent), Some(deadline)) => Some(deadline.min(Instant::now() + silent)),
                (Some(silent), None) => Some(Instant::now() + silent),
                (None, deadline) => deadline,
            };
            let next = match wake_at {
                Some(at) => match tokio::time::timeout_at(at, lines.recv()).await {
                    Ok(next) => next,
                    Err(_) => break Some(FailureReason::TimedOut),
                },
                None => lines.recv().await,
            };
            match next {
                Some(line) => {
                    if !log.push(line) {
                        break Some(FailureReason::LogLimitExceeded);
                    }
                }
                None => break None,
            }
        };
        if let Some(reason) = reason {
            warn!(drv = %ctx.drv_path, ?reason, "killing builder");
            let _ = child.kill().await;
            return Ok(BuildOutcome::Failure {
                reason,
                log_tail: log.tail(),
            });
        }

        let status = match deadline {
            Some(at) => match tokio::time::timeout_at(at, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!(drv = %ctx.drv_path, "killing builder, wall-clock limit reached");
                    let _ = child.kill().await;
                    return Ok(BuildOutcome::Failure {
                        reason: FailureReason::TimedOut,
                        log_tail: log.tail(),
                    });
                }
            },
            None => child.wait().await?,
        };
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            return Ok(BuildOutcome::Failure {
                reason: FailureReason::Exit(code),
                log_tail: log.tail(),
            });
        }

        let mut outputs = BTreeMap::new();
        for (output_name, file) in out_files {
            let contents = match tokio::fs::read(&file).await {
                Ok(contents) => Bytes::from(contents),
                // a missing output is rejected during registration
                Err(_) => continue,
            };
            let references = scan_for_references(&contents, &ctx);
            outputs.insert(output_name, BuiltOutput {
                contents,
                references,
            });
        }
        Ok(BuildOutcome::Success { outputs })
    }
}

/// Finds which input paths an output references, by scanning its
/// contents for their digest strings.
fn scan_for_references(contents: &Bytes, ctx: &BuildContext<'_>) -> StorePathSet {
    let haystack = contents.as_ref();
    ctx.input_paths
        .iter()
        .filter(|path| {
            let needle = cadenza_store_core::base32::encode(path.digest());
            haystack
                .windows(needle.len())
                .any(|w| w == needle.as_bytes())
        })
        .cloned()
        .collect()
}

struct LogSink {
    max_size: u64,
    seen: u64,
    tail_lines: usize,
    tail: std::collections::VecDeque<String>,
}

impl LogSink {
    fn new(limits: &BuildLimits) -> Self {
        LogSink {
            max_size: limits.max_log_size,
            seen: 0,
            tail_lines: limits.log_tail_lines,
            tail: std::collections::VecDeque::new(),
        }
    }

    /// False once the size limit is exceeded.
    fn push(&mut self, line: String) -> bool {
        self.seen += line.len() as u64 + 1;
        debug!(target: "build-log", "{line}");
        if self.tail.len() == self.tail_lines {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
        self.max_size == 0 || self.seen <= self.max_size
    }

    fn tail(self) -> Vec<String> {
        self.tail.into()
    }
}

/// Interleaves stdout and stderr line streams into one channel.
fn merged_lines(
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
) -> tokio::sync::mpsc::Receiver<String> {
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    if let Some(stdout) = stdout {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = stderr {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    rx
}
