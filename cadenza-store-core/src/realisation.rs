// SPDX-License-Identifier: MIT

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::derived_path::OutputName;
use crate::hash::{Hash, ParseHashError};
use crate::signature::Signature;
use crate::store_path::{StorePath, StorePathNameError};

/// The stable identity of one derivation output: the derivation's static
/// hash plus the output name. Rendered as `<drv hash>!<output>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DrvOutput {
    pub drv_hash: Hash,
    pub output_name: OutputName,
}

impl fmt::Display for DrvOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.drv_hash, self.output_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseDrvOutputError {
    #[error("'{0}' does not have the form <drv hash>!<output>")]
    Form(String),
    #[error(transparent)]
    Hash(#[from] ParseHashError),
    #[error(transparent)]
    OutputName(#[from] StorePathNameError),
}

impl FromStr for DrvOutput {
    type Err = ParseDrvOutputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hash, output) = s
            .split_once('!')
            .ok_or_else(|| ParseDrvOutputError::Form(s.into()))?;
        Ok(DrvOutput {
            drv_hash: hash.parse()?,
            output_name: output.parse()?,
        })
    }
}

impl Serialize for DrvOutput {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DrvOutput {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A record that a derivation output was realised at a concrete store
/// path, possibly depending on other realisations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Realisation {
    pub id: DrvOutput,
    pub out_path: StorePath,
    #[serde(default)]
    pub signatures: BTreeSet<Signature>,
    /// Realisations of content-addressed build inputs this one is only
    /// valid relative to.
    #[serde(default)]
    pub dependent_realisations: BTreeMap<DrvOutput, StorePath>,
}

impl Realisation {
    pub fn new(id: DrvOutput, out_path: StorePath) -> Self {
        Realisation {
            id,
            out_path,
            signatures: BTreeSet::new(),
            dependent_realisations: BTreeMap::new(),
        }
    }

    /// The string covered by realisation signatures.
    pub fn fingerprint(&self) -> String {
        format!("{};{}", self.id, self.out_path)
    }
}
