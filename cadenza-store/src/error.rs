// SPDX-License-Identifier: MIT

use cadenza_store_core::store_path::ParseStorePathError;
use cadenza_store_core::StorePath;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("path '{0}' is not valid")]
    InvalidPath(StorePath),

    /// The store advertised the path but could no longer supply it when
    /// asked. Substitution treats this as if the path was never there.
    #[error("substituter no longer has path '{0}'")]
    SubstituteGone(StorePath),

    #[error("path '{path}' from '{uri}' lacks a signature by a trusted key")]
    UntrustedPath { path: StorePath, uri: String },

    #[error("path '{0}' is corrupt")]
    Corrupt(StorePath),

    #[error("cannot parse derivation '{0}': {1}")]
    BadDerivation(StorePath, serde_json::Error),

    #[error(transparent)]
    BadStorePath(#[from] ParseStorePathError),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Misc(String),
}
