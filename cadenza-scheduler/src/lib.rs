// SPDX-License-Identifier: MIT

//! Goal-based realisation of derived paths.
//!
//! Given a set of requests ("this store path must exist", "these outputs
//! of this derivation must be realised"), the scheduler decides per store
//! object whether to accept it as valid, fetch it from a substituter, or
//! build it - under concurrency limits, with cross-process path locks,
//! and with in-flight deduplication so each object is realised at most
//! once per run.
//!
//! [`Realiser`] is the public entry point; everything else hangs off the
//! [`Store`](cadenza_store::Store) and
//! [`DerivationBuilder`](builder::DerivationBuilder) traits.

pub mod builder;
pub mod counters;
mod derivation_goal;
mod drv_output_substitution_goal;
pub mod entry;
pub mod error;
pub mod goal;
mod hook;
pub mod pathlocks;
pub mod settings;
mod substitution_goal;
mod worker;

pub use builder::{BuildOutcome, BuiltOutput, DerivationBuilder, FailureReason, ProcessBuilder};
pub use counters::{Counts, ProgressCounters};
pub use entry::Realiser;
pub use error::SchedulerError;
pub use goal::{ExitCode, WorkResult};
pub use settings::SchedulerSettings;
