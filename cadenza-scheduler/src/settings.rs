// SPDX-License-Identifier: MIT

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Knobs controlling one [`Realiser`](crate::Realiser). Populated by the
/// embedder; the defaults are sensible for a single-user setup.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Maximum concurrent local builds. 0 means local building is
    /// disabled and everything must go through the build hook.
    pub max_build_jobs: usize,
    /// Maximum concurrent substitution transfers.
    pub max_substitution_jobs: usize,
    /// Maximum concurrent builds handed to the build hook.
    pub max_hook_instances: usize,
    /// Whether to try substituters at all.
    pub use_substitutes: bool,
    /// Whether to fall back to building when a substituter fails (as
    /// opposed to merely not having the path).
    pub try_fallback: bool,
    /// Keep realising other goals after one top-level goal fails.
    pub keep_going: bool,
    /// How long to sleep between attempts on a contended path lock.
    pub lock_poll_interval: Duration,
    /// How many lock attempts before giving up on the goal.
    pub max_lock_retries: u32,
    /// Wall-clock limit for one build, if any.
    pub build_timeout: Option<Duration>,
    /// Limit on time without any builder output, if any.
    pub max_silent_time: Option<Duration>,
    /// Build log size limit in bytes. 0 means unlimited.
    pub max_log_size: u64,
    /// How many trailing log lines to keep for error reports.
    pub log_tail_lines: usize,
    /// The build hook program, if remote building is enabled.
    pub build_hook: Option<PathBuf>,
    /// Program to run after every successful local build.
    pub post_build_hook: Option<PathBuf>,
    /// The platform this process can build for.
    pub system: String,
    /// Extra features this system offers to derivations that require
    /// them.
    pub system_features: BTreeSet<String>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            max_build_jobs: 1,
            max_substitution_jobs: 16,
            max_hook_instances: 4,
            use_substitutes: true,
            try_fallback: false,
            keep_going: false,
            lock_poll_interval: Duration::from_secs(5),
            max_lock_retries: 120,
            build_timeout: None,
            max_silent_time: None,
            max_log_size: 8 * 1024 * 1024,
            log_tail_lines: 32,
            build_hook: None,
            post_build_hook: None,
            system: "x86_64-linux".into(),
            system_features: BTreeSet::new(),
        }
    }
}
