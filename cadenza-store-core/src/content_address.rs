// SPDX-License-Identifier: MIT

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::{Hash, ParseHashError};

/// How the contents behind a content address were ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentAddressMethod {
    /// Reference-free flat text (derivation files).
    Text,
    /// A single flat file.
    Flat,
    /// A serialized archive of a file tree.
    Recursive,
}

/// A content address: ingestion method plus content hash. Rendered as
/// `text:<hash>`, `fixed:<hash>` or `fixed:r:<hash>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentAddress {
    pub method: ContentAddressMethod,
    pub hash: Hash,
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.method {
            ContentAddressMethod::Text => write!(f, "text:{}", self.hash),
            ContentAddressMethod::Flat => write!(f, "fixed:{}", self.hash),
            ContentAddressMethod::Recursive => write!(f, "fixed:r:{}", self.hash),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseContentAddressError {
    #[error("content address '{0}' has an unknown prefix")]
    Prefix(String),
    #[error(transparent)]
    Hash(#[from] ParseHashError),
}

impl FromStr for ContentAddress {
    type Err = ParseContentAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (method, rest) = if let Some(rest) = s.strip_prefix("text:") {
            (ContentAddressMethod::Text, rest)
        } else if let Some(rest) = s.strip_prefix("fixed:r:") {
            (ContentAddressMethod::Recursive, rest)
        } else if let Some(rest) = s.strip_prefix("fixed:") {
            (ContentAddressMethod::Flat, rest)
        } else {
            return Err(ParseContentAddressError::Prefix(s.into()));
        };
        Ok(ContentAddress {
            method,
            hash: rest.parse()?,
        })
    }
}

impl Serialize for ContentAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("text:sha256:1sfdxziarxw8j3p80lvswgpq9i7smdyxmmsj5sjhhgjdjfwjfkdr")]
    #[case("fixed:sha256:1sfdxziarxw8j3p80lvswgpq9i7smdyxmmsj5sjhhgjdjfwjfkdr")]
    #[case("fixed:r:sha1:84983e441c3bd26ebaae4aa1f95129e5e54670f1")]
    fn roundtrip(#[case] s: &str) {
        let ca: ContentAddress = s.parse().unwrap();
        let printed = ca.to_string();
        assert_eq!(printed.parse::<ContentAddress>().unwrap(), ca);
    }

    #[test]
    fn rejects_unknown_prefix() {
        assert!("git:sha256:abc".parse::<ContentAddress>().is_err());
    }
}
