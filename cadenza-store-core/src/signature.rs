// SPDX-License-Identifier: MIT

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A detached signature over a store object fingerprint, rendered as
/// `<key name>:<base64 payload>`. Verification of the payload happens at
/// the store layer; this type only carries it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature {
    key_name: String,
    payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("signature '{0}' does not have the form <key name>:<payload>")]
pub struct ParseSignatureError(String);

impl Signature {
    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// Whether this signature claims one of the given key names.
    pub fn is_by_trusted_key(&self, trusted_keys: &[String]) -> bool {
        trusted_keys.iter().any(|k| k == &self.key_name)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key_name, self.payload)
    }
}

impl FromStr for Signature {
    type Err = ParseSignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key_name, payload) = s
            .split_once(':')
            .ok_or_else(|| ParseSignatureError(s.into()))?;
        if key_name.is_empty() || payload.is_empty() {
            return Err(ParseSignatureError(s.into()));
        }
        Ok(Signature {
            key_name: key_name.to_string(),
            payload: payload.to_string(),
        })
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_trust() {
        let sig: Signature = "cache.example.org-1:dGVzdA==".parse().unwrap();
        assert_eq!(sig.key_name(), "cache.example.org-1");
        assert!(sig.is_by_trusted_key(&["cache.example.org-1".to_string()]));
        assert!(!sig.is_by_trusted_key(&["other".to_string()]));
        assert!("nocolon".parse::<Signature>().is_err());
    }
}
