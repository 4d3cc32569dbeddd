// SPDX-License-Identifier: MIT

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::derived_path::{DerivedPath, OutputName, OutputSpec};
use crate::realisation::Realisation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Do nothing for valid paths, realise the rest.
    #[default]
    Normal,
    /// Rebuild or re-substitute even paths that are already valid.
    Repair,
    /// Rebuild already-valid paths and compare the results, without
    /// replacing them.
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    /// We built it ourselves (or via the build hook).
    Built,
    /// A substituter supplied it.
    Substituted,
    /// Nothing to do, the requested outputs were already valid.
    AlreadyValid,
    /// The derivation resolved to one whose outputs were already valid.
    ResolvesToAlreadyValid,
    /// A sandboxed build failed; retrying will not help.
    PermanentFailure,
    /// An unsandboxed build failed, or resources ran out; retrying might
    /// help.
    TransientFailure,
    /// A check-mode rebuild did not reproduce the existing output.
    NotDeterministic,
    /// The builder reported success but its outputs were unacceptable.
    OutputRejected,
    /// An input derivation failed to build.
    DependencyFailed,
    /// The build exceeded its time or silence limit.
    TimedOut,
    /// The build log exceeded its size limit.
    LogLimitExceeded,
    /// Substitution was requested but no substituter has the path.
    NoSubstituters,
    /// Anything else.
    MiscFailure,
}

impl BuildStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            BuildStatus::Built
                | BuildStatus::Substituted
                | BuildStatus::AlreadyValid
                | BuildStatus::ResolvesToAlreadyValid
        )
    }
}

/// The outcome of realising one derived path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub status: BuildStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    /// How often this derivation was built; >1 only for check-mode
    /// repeats.
    #[serde(default)]
    pub times_built: u32,
    /// Whether a repeated build produced a different result.
    #[serde(default)]
    pub is_non_deterministic: bool,
    #[serde(default)]
    pub start_time: u64,
    #[serde(default)]
    pub stop_time: u64,
    /// The realisations of the built outputs, keyed by output name.
    #[serde(default)]
    pub built_outputs: BTreeMap<OutputName, Realisation>,
}

impl BuildResult {
    pub fn new(status: BuildStatus) -> Self {
        BuildResult {
            status,
            error_msg: None,
            times_built: 0,
            is_non_deterministic: false,
            start_time: 0,
            stop_time: 0,
            built_outputs: BTreeMap::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.status.is_success()
    }

    /// A copy with `built_outputs` narrowed to the given spec, for
    /// reporting to a requester that asked for fewer outputs than were
    /// realised.
    pub fn restrict_to(&self, outputs: &OutputSpec) -> BuildResult {
        let mut result = self.clone();
        result
            .built_outputs
            .retain(|name, _| outputs.contains(name));
        result
    }
}

/// A build result paired with the derived path that requested it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyedBuildResult {
    pub path: DerivedPath,
    pub result: BuildResult,
}
