// SPDX-License-Identifier: MIT

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::store_path::{ParseStorePathError, StorePath, StorePathNameError, validate_name};

/// The name of a derivation output (`out`, `dev`, `lib`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputName(String);

impl OutputName {
    pub fn is_default(&self) -> bool {
        self.0 == "out"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OutputName {
    fn default() -> Self {
        OutputName("out".into())
    }
}

impl AsRef<str> for OutputName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for OutputName {
    type Err = StorePathNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_name(s)?;
        Ok(OutputName(s.to_string()))
    }
}

/// Which outputs of a derivation are wanted: all of them, or a named
/// non-empty subset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutputSpec {
    All,
    Named(BTreeSet<OutputName>),
}

impl OutputSpec {
    pub fn contains(&self, name: &OutputName) -> bool {
        match self {
            OutputSpec::All => true,
            OutputSpec::Named(names) => names.contains(name),
        }
    }

    pub fn is_subset_of(&self, other: &OutputSpec) -> bool {
        match (self, other) {
            (_, OutputSpec::All) => true,
            (OutputSpec::All, OutputSpec::Named(_)) => false,
            (OutputSpec::Named(a), OutputSpec::Named(b)) => a.is_subset(b),
        }
    }

    /// Widens `self` to also cover `other`. Returns true if the spec grew.
    pub fn union_with(&mut self, other: &OutputSpec) -> bool {
        match (&mut *self, other) {
            (OutputSpec::All, _) => false,
            (OutputSpec::Named(_), OutputSpec::All) => {
                *self = OutputSpec::All;
                true
            }
            (OutputSpec::Named(a), OutputSpec::Named(b)) => {
                let before = a.len();
                a.extend(b.iter().cloned());
                a.len() != before
            }
        }
    }
}

impl fmt::Display for OutputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSpec::All => f.write_str("*"),
            OutputSpec::Named(outputs) => {
                let mut first = true;
                for output in outputs {
                    if !first {
                        f.write_str(",")?;
                    }
                    first = false;
                    write!(f, "{output}")?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for OutputSpec {
    type Err = StorePathNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(OutputSpec::All);
        }
        let mut outputs = BTreeSet::new();
        for name in s.split(',') {
            outputs.insert(name.parse()?);
        }
        Ok(OutputSpec::Named(outputs))
    }
}

impl Serialize for OutputSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OutputSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A request against the store: either an opaque store path that must
/// exist, or a set of outputs of a derivation that must be realised.
/// Rendered with `^` separating the derivation from its output spec.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DerivedPath {
    Opaque(StorePath),
    Built {
        drv_path: StorePath,
        outputs: OutputSpec,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseDerivedPathError {
    #[error(transparent)]
    Path(#[from] ParseStorePathError),
    #[error("invalid output spec in '{0}': {1}")]
    Outputs(String, StorePathNameError),
}

impl fmt::Display for DerivedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DerivedPath::Opaque(path) => write!(f, "{path}"),
            DerivedPath::Built { drv_path, outputs } => write!(f, "{drv_path}^{outputs}"),
        }
    }
}

impl FromStr for DerivedPath {
    type Err = ParseDerivedPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('^') {
            None => Ok(DerivedPath::Opaque(s.parse()?)),
            Some((drv, outputs)) => Ok(DerivedPath::Built {
                drv_path: drv.parse()?,
                outputs: outputs
                    .parse()
                    .map_err(|e| ParseDerivedPathError::Outputs(s.into(), e))?,
            }),
        }
    }
}

impl Serialize for DerivedPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DerivedPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
