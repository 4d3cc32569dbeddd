// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use cadenza_store::StoreError;
use cadenza_store_core::derivation::DerivationError;
use cadenza_store_core::{OutputName, StorePath};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Derivation(#[from] DerivationError),

    #[error("derivation '{drv_path}' does not have wanted output '{output}'")]
    MissingWantedOutput {
        drv_path: StorePath,
        output: OutputName,
    },

    #[error("pure derivation '{drv_path}' depends on impure derivation '{input_drv}'")]
    ImpureInput {
        drv_path: StorePath,
        input_drv: StorePath,
    },

    #[error("dependency '{dep}' of '{drv_path}' does not exist, and substitution is disabled")]
    MissingInput { drv_path: StorePath, dep: StorePath },

    #[error("could not acquire lock on '{0}' after {1} attempts")]
    LockTimeout(PathBuf, u32),

    #[error(
        "unable to start any build; either increase the number of build jobs \
         or enable remote building"
    )]
    NoBuildSlots,

    #[error("some builds failed (exit status {exit_status}): {failed:?}")]
    BuildsFailed {
        failed: Vec<String>,
        exit_status: u32,
    },

    #[error("path '{0}' does not exist and cannot be created")]
    CannotSubstitute(StorePath),

    #[error("cannot repair path '{0}'")]
    CannotRepair(StorePath),

    #[error("some outputs of '{0}' are not valid, so checking is not possible")]
    CheckNotPossible(StorePath),

    #[error("build hook failed: {0}")]
    Hook(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Misc(String),
}
