// SPDX-License-Identifier: MIT

use std::fmt;
use std::str::FromStr;

use data_encoding::{BASE64, HEXLOWER};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use thiserror::Error;

use crate::base32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgo {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgo::Md5 => "md5",
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Sha256 => "sha256",
            HashAlgo::Sha512 => "sha512",
        }
    }

    pub fn digest_size(&self) -> usize {
        match self {
            HashAlgo::Md5 => 16,
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha512 => 64,
        }
    }

    pub fn base16_len(&self) -> usize {
        self.digest_size() * 2
    }

    pub fn base32_len(&self) -> usize {
        base32::encoded_len(self.digest_size())
    }

    pub fn base64_len(&self) -> usize {
        self.digest_size().div_ceil(3) * 4
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgo {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md5" => Ok(HashAlgo::Md5),
            "sha1" => Ok(HashAlgo::Sha1),
            "sha256" => Ok(HashAlgo::Sha256),
            "sha512" => Ok(HashAlgo::Sha512),
            _ => Err(ParseHashError::UnknownAlgorithm(s.into())),
        }
    }
}

/// A hash digest tagged with its algorithm.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash {
    pub algo: HashAlgo,
    digest: Vec<u8>,
}

impl Hash {
    pub fn new(algo: HashAlgo, digest: Vec<u8>) -> Result<Self, ParseHashError> {
        if digest.len() != algo.digest_size() {
            return Err(ParseHashError::InvalidDigestSize {
                algo,
                expected: algo.digest_size(),
                actual: digest.len(),
            });
        }
        Ok(Hash { algo, digest })
    }

    pub fn sha256_of(data: &[u8]) -> Self {
        Hash {
            algo: HashAlgo::Sha256,
            digest: Sha256::digest(data).to_vec(),
        }
    }

    pub fn sha512_of(data: &[u8]) -> Self {
        Hash {
            algo: HashAlgo::Sha512,
            digest: Sha512::digest(data).to_vec(),
        }
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    pub fn to_base16(&self) -> String {
        HEXLOWER.encode(&self.digest)
    }

    pub fn to_base32(&self) -> String {
        base32::encode(&self.digest)
    }
}

/// Renders as `algo:base32digest`, the canonical textual form.
impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.to_base32())
    }
}

/// Parses `algo:digest` where the digest may be base16, base32 or base64,
/// disambiguated by length.
impl FromStr for Hash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo_str, digest_str) = s
            .split_once(':')
            .ok_or_else(|| ParseHashError::MissingAlgorithm(s.into()))?;
        let algo: HashAlgo = algo_str.parse()?;
        let digest = if digest_str.len() == algo.base16_len() {
            HEXLOWER
                .decode(digest_str.as_bytes())
                .map_err(|e| ParseHashError::Encoding(e.to_string()))?
        } else if digest_str.len() == algo.base32_len() {
            base32::decode(digest_str).map_err(|e| ParseHashError::Encoding(e.to_string()))?
        } else if digest_str.len() == algo.base64_len() {
            BASE64
                .decode(digest_str.as_bytes())
                .map_err(|e| ParseHashError::Encoding(e.to_string()))?
        } else {
            return Err(ParseHashError::InvalidDigestLength {
                algo,
                actual: digest_str.len(),
            });
        };
        Hash::new(algo, digest)
    }
}

impl Serialize for Hash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseHashError {
    #[error("unknown hash algorithm '{0}'")]
    UnknownAlgorithm(String),
    #[error("hash '{0}' lacks an algorithm prefix")]
    MissingAlgorithm(String),
    #[error("invalid {algo} digest size: expected {expected} bytes, got {actual}")]
    InvalidDigestSize {
        algo: HashAlgo,
        expected: usize,
        actual: usize,
    },
    #[error("digest of length {actual} matches no encoding of {algo}")]
    InvalidDigestLength { algo: HashAlgo, actual: usize },
    #[error("{0}")]
    Encoding(String),
}
