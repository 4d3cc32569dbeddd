// SPDX-License-Identifier: MIT

//! Progress accounting shared by all goals of one scheduler run.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub expected_builds: u64,
    pub running_builds: u64,
    pub done_builds: u64,
    pub failed_builds: u64,
    pub expected_substitutions: u64,
    pub running_substitutions: u64,
    pub done_substitutions: u64,
    pub failed_substitutions: u64,
    pub expected_download_size: u64,
    pub done_download_size: u64,
    pub expected_nar_size: u64,
    pub done_nar_size: u64,
}

/// One lock-protected set of counters with change notification; clones
/// of the receiver can drive progress reporting without polling.
pub struct ProgressCounters {
    tx: watch::Sender<Counts>,
}

impl Default for ProgressCounters {
    fn default() -> Self {
        ProgressCounters {
            tx: watch::Sender::new(Counts::default()),
        }
    }
}

impl ProgressCounters {
    pub fn snapshot(&self) -> Counts {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Counts> {
        self.tx.subscribe()
    }

    pub fn update(&self, f: impl FnOnce(&mut Counts)) {
        self.tx.send_modify(f);
    }

    /// Registers an expected build; resolved by the returned lease.
    pub fn expect_build(self: &Arc<Self>) -> BuildLease {
        self.update(|c| c.expected_builds += 1);
        BuildLease {
            counters: self.clone(),
            resolved: false,
        }
    }

    /// Registers an expected substitution with its transfer sizes.
    pub fn expect_substitution(self: &Arc<Self>, download_size: u64, nar_size: u64) -> SubstitutionLease {
        self.update(|c| {
            c.expected_substitutions += 1;
            c.expected_download_size += download_size;
            c.expected_nar_size += nar_size;
        });
        SubstitutionLease {
            counters: self.clone(),
            download_size,
            nar_size,
            resolved: false,
        }
    }

    /// Marks a build as running until the guard drops.
    pub fn running_build(self: &Arc<Self>) -> RunningGuard {
        self.update(|c| c.running_builds += 1);
        RunningGuard {
            counters: self.clone(),
            build: true,
        }
    }

    pub fn running_substitution(self: &Arc<Self>) -> RunningGuard {
        self.update(|c| c.running_substitutions += 1);
        RunningGuard {
            counters: self.clone(),
            build: false,
        }
    }
}

/// An expected build. Call [`done`](Self::done) or [`failed`](Self::failed)
/// on completion; dropping unresolved just retracts the expectation
/// (e.g. the outputs turned out to be valid).
pub struct BuildLease {
    counters: Arc<ProgressCounters>,
    resolved: bool,
}

impl BuildLease {
    pub fn done(mut self) {
        self.resolved = true;
        self.counters.update(|c| {
            c.expected_builds -= 1;
            c.done_builds += 1;
        });
    }

    pub fn failed(mut self) {
        self.resolved = true;
        self.counters.update(|c| {
            c.expected_builds -= 1;
            c.failed_builds += 1;
        });
    }
}

impl Drop for BuildLease {
    fn drop(&mut self) {
        if !self.resolved {
            self.counters.update(|c| c.expected_builds -= 1);
        }
    }
}

pub struct SubstitutionLease {
    counters: Arc<ProgressCounters>,
    download_size: u64,
    nar_size: u64,
    resolved: bool,
}

impl SubstitutionLease {
    pub fn done(mut self) {
        self.resolved = true;
        let (download_size, nar_size) = (self.download_size, self.nar_size);
        self.counters.update(|c| {
            c.expected_substitutions -= 1;
            c.done_substitutions += 1;
            c.expected_download_size -= download_size;
            c.done_download_size += download_size;
            c.expected_nar_size -= nar_size;
            c.done_nar_size += nar_size;
        });
    }

    pub fn failed(mut self) {
        self.resolved = true;
        let (download_size, nar_size) = (self.download_size, self.nar_size);
        self.counters.update(|c| {
            c.expected_substitutions -= 1;
            c.failed_substitutions += 1;
            c.expected_download_size -= download_size;
            c.expected_nar_size -= nar_size;
        });
    }
}

impl Drop for SubstitutionLease {
    fn drop(&mut self) {
        if !self.resolved {
            let (download_size, nar_size) = (self.download_size, self.nar_size);
            self.counters.update(|c| {
                c.expected_substitutions -= 1;
                c.expected_download_size -= download_size;
                c.expected_nar_size -= nar_size;
            });
        }
    }
}

pub struct RunningGuard {
    counters: Arc<ProgressCounters>,
    build: bool,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.counters.update(|c| {
            if self.build {
                c.running_builds -= 1;
            } else {
                c.running_substitutions -= 1;
            }
        });
    }
}
