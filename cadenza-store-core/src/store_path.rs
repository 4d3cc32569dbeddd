// SPDX-License-Identifier: MIT

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::base32;
use crate::content_address::{ContentAddress, ContentAddressMethod};
use crate::hash::{Hash, HashAlgo};

pub const DIGEST_SIZE: usize = 20;
pub const ENCODED_DIGEST_SIZE: usize = base32::encoded_len(DIGEST_SIZE);
const MAX_NAME_LEN: usize = 211;

pub type StorePathSet = BTreeSet<StorePath>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorePathNameError {
    #[error("name is empty or longer than {MAX_NAME_LEN} characters")]
    NameLength,
    #[error("invalid character {c:?} at offset {at}", c = *.1 as char, at = .0)]
    Symbol(usize, u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseStorePathError {
    #[error("'{0}' is not a valid store path: {1}")]
    Name(String, StorePathNameError),
    #[error("'{0}' does not have the form <digest>-<name>")]
    Form(String),
    #[error("'{0}' has an invalid digest")]
    Digest(String),
    #[error("path '{0}' is not in the store directory '{1}'")]
    NotInStore(String, String),
}

/// The name part of a store path. Limited charset, at most 211 bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct StorePathName(String);

impl StorePathName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorePathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn validate_name(s: &str) -> Result<(), StorePathNameError> {
    if s.is_empty() || s.len() > MAX_NAME_LEN {
        return Err(StorePathNameError::NameLength);
    }
    for (i, b) in s.bytes().enumerate() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' => {}
            b'+' | b'-' | b'.' | b'_' | b'?' | b'=' => {}
            _ => return Err(StorePathNameError::Symbol(i, b)),
        }
    }
    Ok(())
}

impl FromStr for StorePathName {
    type Err = StorePathNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_name(s)?;
        Ok(StorePathName(s.to_string()))
    }
}

impl<'de> Deserialize<'de> for StorePathName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A store path: a 20-byte digest plus a name, rendered as
/// `<32 base32 chars>-<name>`. The store directory prefix is not part of
/// the value; [`StoreDir`] adds it back for display and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath {
    digest: [u8; DIGEST_SIZE],
    name: StorePathName,
}

impl StorePath {
    pub fn new(digest: [u8; DIGEST_SIZE], name: StorePathName) -> Self {
        StorePath { digest, name }
    }

    pub fn digest(&self) -> &[u8; DIGEST_SIZE] {
        &self.digest
    }

    pub fn name(&self) -> &StorePathName {
        &self.name
    }

    pub fn is_derivation(&self) -> bool {
        self.name.0.ends_with(".drv")
    }

    /// The name with a `.drv` suffix removed, as used to name outputs.
    pub fn derivation_name(&self) -> Result<StorePathName, StorePathNameError> {
        self.name.0.strip_suffix(".drv").unwrap_or(&self.name.0).parse()
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", base32::encode(&self.digest), self.name)
    }
}

impl FromStr for StorePath {
    type Err = ParseStorePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() < ENCODED_DIGEST_SIZE + 1 || s.as_bytes()[ENCODED_DIGEST_SIZE] != b'-' {
            return Err(ParseStorePathError::Form(s.into()));
        }
        let (digest_str, rest) = s.split_at(ENCODED_DIGEST_SIZE);
        let digest_bytes = base32::decode(digest_str)
            .map_err(|_| ParseStorePathError::Digest(s.into()))?;
        let digest: [u8; DIGEST_SIZE] = digest_bytes
            .try_into()
            .map_err(|_| ParseStorePathError::Digest(s.into()))?;
        let name = rest[1..]
            .parse()
            .map_err(|e| ParseStorePathError::Name(s.into(), e))?;
        Ok(StorePath { digest, name })
    }
}

impl Serialize for StorePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StorePath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The store directory prefix, e.g. `/nix/store`. Knows how to mint new
/// store paths from content addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreDir(String);

impl Default for StoreDir {
    fn default() -> Self {
        StoreDir("/nix/store".into())
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StoreDir {
    pub fn new(dir: impl Into<String>) -> Self {
        StoreDir(dir.into())
    }

    pub fn display_path(&self, path: &StorePath) -> String {
        format!("{}/{}", self.0, path)
    }

    /// Parses a full path (`<store dir>/<digest>-<name>`) into a store path.
    pub fn parse_path(&self, s: &str) -> Result<StorePath, ParseStorePathError> {
        let base = s
            .strip_prefix(self.0.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| ParseStorePathError::NotInStore(s.into(), self.0.clone()))?;
        base.parse()
    }

    fn make_store_path(&self, path_type: &str, hash: &Hash, name: &StorePathName) -> StorePath {
        let fingerprint = format!(
            "{}:{}:{}:{}:{}",
            path_type,
            hash.algo,
            hash.to_base16(),
            self.0,
            name
        );
        let full = Sha256::digest(fingerprint.as_bytes());
        let mut digest = [0u8; DIGEST_SIZE];
        for (i, b) in full.iter().enumerate() {
            digest[i % DIGEST_SIZE] ^= b;
        }
        StorePath::new(digest, name.clone())
    }

    /// The store path of a fixed-output or text object with the given
    /// content address.
    pub fn make_store_path_from_ca(&self, name: &StorePathName, ca: &ContentAddress) -> StorePath {
        match ca.method {
            ContentAddressMethod::Text => self.make_store_path("text", &ca.hash, name),
            ContentAddressMethod::Recursive if ca.hash.algo == HashAlgo::Sha256 => {
                self.make_store_path("source", &ca.hash, name)
            }
            _ => {
                let prefix = match ca.method {
                    ContentAddressMethod::Recursive => "r:",
                    _ => "",
                };
                let inner = Hash::sha256_of(
                    format!("fixed:out:{}{}:{}:", prefix, ca.hash.algo, ca.hash.to_base16())
                        .as_bytes(),
                );
                self.make_store_path("output:out", &inner, name)
            }
        }
    }

    /// The store path of a reference-free text object (used for derivation
    /// files written back to the store).
    pub fn make_text_path(&self, name: &StorePathName, contents: &[u8]) -> StorePath {
        self.make_store_path("text", &Hash::sha256_of(contents), name)
    }

    /// The store path of a derivation output whose derivation hashes to
    /// `drv_hash`.
    pub fn make_output_path(
        &self,
        output_id: &str,
        drv_hash: &Hash,
        name: &StorePathName,
    ) -> StorePath {
        self.make_store_path(&format!("output:{output_id}"), drv_hash, name)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("00000000000000000000000000000000-_", true)]
    #[case("g9ngnw4w5vr9y3xkb7k2awl3mp95abrb-konsole-18.12.3", true)]
    #[case("00000000000000000000000000000000-.drv", true)]
    #[case("00000000000000000000000000000000", false)]
    #[case("0000000000000000000000000000000-x", false)]
    #[case("t0000000000000000000000000000000-x", false)]
    #[case("00000000000000000000000000000000-foo bar", false)]
    fn parse(#[case] s: &str, #[case] ok: bool) {
        let parsed: Result<StorePath, _> = s.parse();
        assert_eq!(parsed.is_ok(), ok, "{s}: {parsed:?}");
        if let Ok(path) = parsed {
            assert_eq!(path.to_string(), s);
        }
    }

    #[test]
    fn store_dir_roundtrip() {
        let dir = StoreDir::default();
        let path: StorePath = "00000000000000000000000000000000-a.drv".parse().unwrap();
        let full = dir.display_path(&path);
        assert_eq!(full, "/nix/store/00000000000000000000000000000000-a.drv");
        assert_eq!(dir.parse_path(&full).unwrap(), path);
        assert!(dir.parse_path("/srv/store/00000000000000000000000000000000-a").is_err());
    }

    // Expected values confirmed against the reference CLI.
    #[rstest]
    #[case(
        "fixed:sha256:248d6a61d20638b8e5c026930c3e6039a33ce45964ff2167f6ecedd419db06c1",
        "jw8chmp9sf8f7pw684cszp6pa2zmn0bx-konsole-18.12.3"
    )]
    #[case(
        "fixed:r:sha1:84983e441c3bd26ebaae4aa1f95129e5e54670f1",
        "ww9d58nz1xsl5ck0vcpc99h23l1y2hln-konsole-18.12.3"
    )]
    #[case(
        "fixed:r:sha256:248d6a61d20638b8e5c026930c3e6039a33ce45964ff2167f6ecedd419db06c1",
        "1w01xxn8f7s9s4n65ry6rwd7x9awf04s-konsole-18.12.3"
    )]
    fn ca_paths(#[case] ca: &str, #[case] expected: &str) {
        let dir = StoreDir::default();
        let ca: ContentAddress = ca.parse().unwrap();
        let name: StorePathName = "konsole-18.12.3".parse().unwrap();
        assert_eq!(
            dir.make_store_path_from_ca(&name, &ca).to_string(),
            expected
        );
    }

    #[test]
    fn derivation_name_strips_suffix() {
        let path: StorePath = "00000000000000000000000000000000-hello-1.0.drv"
            .parse()
            .unwrap();
        assert!(path.is_derivation());
        assert_eq!(path.derivation_name().unwrap().as_str(), "hello-1.0");
    }
}
