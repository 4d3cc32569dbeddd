// SPDX-License-Identifier: MIT

use std::collections::BTreeSet;

use cadenza_store_core::{ContentAddress, Hash, Signature, StorePath};
use cadenza_store_core::store_path::StorePathSet;
use serde::{Deserialize, Serialize};

/// Metadata about a valid store object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathInfo {
    pub path: StorePath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deriver: Option<StorePath>,
    pub nar_hash: Hash,
    pub nar_size: u64,
    #[serde(default)]
    pub references: StorePathSet,
    #[serde(default)]
    pub sigs: BTreeSet<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<ContentAddress>,
    /// Built locally; trusted regardless of signatures.
    #[serde(default)]
    pub ultimate: bool,
    #[serde(default)]
    pub registration_time: u64,
}

impl PathInfo {
    pub fn new(path: StorePath, nar_hash: Hash, nar_size: u64) -> Self {
        PathInfo {
            path,
            deriver: None,
            nar_hash,
            nar_size,
            references: StorePathSet::new(),
            sigs: BTreeSet::new(),
            ca: None,
            ultimate: false,
            registration_time: 0,
        }
    }

    /// Whether a signature-requiring store may accept this info from an
    /// untrusted source. Content-addressed objects carry their own proof.
    pub fn is_trustworthy(&self, trusted_keys: &[String]) -> bool {
        self.ultimate
            || self.ca.is_some()
            || self.sigs.iter().any(|s| s.is_by_trusted_key(trusted_keys))
    }
}
