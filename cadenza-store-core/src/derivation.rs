// SPDX-License-Identifier: MIT

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::base32;
use crate::content_address::{ContentAddress, ContentAddressMethod};
use crate::derived_path::{OutputName, OutputSpec};
use crate::hash::{Hash, HashAlgo};
use crate::store_path::{
    StoreDir, StorePath, StorePathName, StorePathNameError, StorePathSet,
};

/// Formats the store path name of an output: the derivation name for the
/// default `out` output, `name-output` otherwise.
pub struct OutputPathName<'a> {
    pub drv_name: &'a StorePathName,
    pub output_name: &'a OutputName,
}

impl fmt::Display for OutputPathName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.output_name.is_default() {
            write!(f, "{}", self.drv_name)
        } else {
            write!(f, "{}-{}", self.drv_name, self.output_name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivationOutput {
    /// The output path was computed up front from the derivation.
    InputAddressed(StorePath),
    /// Fixed-output: the content hash is known in advance, so the path is
    /// too.
    CAFixed(ContentAddress),
    /// Content-addressed with the hash only known after building.
    CAFloating {
        method: ContentAddressMethod,
        hash_algo: HashAlgo,
    },
    /// Input-addressed, but the path depends on unresolved
    /// content-addressed inputs.
    Deferred,
    /// The output of an impure derivation; never cacheable.
    Impure {
        method: ContentAddressMethod,
        hash_algo: HashAlgo,
    },
}

/// Serialization helper; the variant is reconstructed from which fields
/// are present.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDerivationOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<StorePath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<Hash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<ContentAddressMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash_algo: Option<HashAlgo>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    impure: bool,
}

impl Serialize for DerivationOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = match self {
            DerivationOutput::InputAddressed(path) => RawDerivationOutput {
                path: Some(path.clone()),
                hash: None,
                method: None,
                hash_algo: None,
                impure: false,
            },
            DerivationOutput::CAFixed(ca) => RawDerivationOutput {
                path: None,
                hash: Some(ca.hash.clone()),
                method: Some(ca.method),
                hash_algo: None,
                impure: false,
            },
            DerivationOutput::CAFloating { method, hash_algo } => RawDerivationOutput {
                path: None,
                hash: None,
                method: Some(*method),
                hash_algo: Some(*hash_algo),
                impure: false,
            },
            DerivationOutput::Deferred => RawDerivationOutput {
                path: None,
                hash: None,
                method: None,
                hash_algo: None,
                impure: false,
            },
            DerivationOutput::Impure { method, hash_algo } => RawDerivationOutput {
                path: None,
                hash: None,
                method: Some(*method),
                hash_algo: Some(*hash_algo),
                impure: true,
            },
        };
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DerivationOutput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error as _;
        let raw = RawDerivationOutput::deserialize(deserializer)?;
        if let Some(path) = raw.path {
            Ok(DerivationOutput::InputAddressed(path))
        } else if let Some(hash) = raw.hash {
            let method = raw.method.ok_or_else(|| D::Error::missing_field("method"))?;
            Ok(DerivationOutput::CAFixed(ContentAddress { method, hash }))
        } else if let Some(method) = raw.method {
            let hash_algo = raw
                .hash_algo
                .ok_or_else(|| D::Error::missing_field("hashAlgo"))?;
            if raw.impure {
                Ok(DerivationOutput::Impure { method, hash_algo })
            } else {
                Ok(DerivationOutput::CAFloating { method, hash_algo })
            }
        } else {
            Ok(DerivationOutput::Deferred)
        }
    }
}

impl DerivationOutput {
    /// The store path of this output, if it can be known without building.
    pub fn path(
        &self,
        store_dir: &StoreDir,
        drv_name: &StorePathName,
        output_name: &OutputName,
    ) -> Result<Option<StorePath>, StorePathNameError> {
        match self {
            DerivationOutput::InputAddressed(path) => Ok(Some(path.clone())),
            DerivationOutput::CAFixed(ca) => {
                let name = OutputPathName {
                    drv_name,
                    output_name,
                }
                .to_string()
                .parse()?;
                Ok(Some(store_dir.make_store_path_from_ca(&name, ca)))
            }
            _ => Ok(None),
        }
    }
}

/// Broad classification of a derivation, determining sandboxing and
/// whether output paths are known up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivationType {
    InputAddressed { deferred: bool },
    ContentAddressed { fixed: bool },
    Impure,
}

impl DerivationType {
    pub fn is_pure(&self) -> bool {
        !matches!(self, DerivationType::Impure)
    }

    pub fn is_fixed_output(&self) -> bool {
        matches!(self, DerivationType::ContentAddressed { fixed: true })
    }

    /// Fixed-output and impure builds get network access and run outside
    /// the sandbox; their failures are treated as transient.
    pub fn is_sandboxed(&self) -> bool {
        match self {
            DerivationType::InputAddressed { .. } => true,
            DerivationType::ContentAddressed { fixed } => !fixed,
            DerivationType::Impure => false,
        }
    }

    pub fn has_known_output_paths(&self) -> bool {
        match self {
            DerivationType::InputAddressed { deferred } => !deferred,
            DerivationType::ContentAddressed { fixed } => *fixed,
            DerivationType::Impure => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DerivationError {
    #[error("derivation '{0}' has no outputs")]
    NoOutputs(StorePathName),
    #[error("derivation '{0}' mixes incompatible output kinds")]
    MixedOutputs(StorePathName),
    #[error("derivation '{0}' does not produce output '{1}'")]
    NoSuchOutput(StorePathName, OutputName),
    #[error(transparent)]
    Name(#[from] StorePathNameError),
    #[error("derivation '{0}' could not be serialized: {1}")]
    Serialize(StorePathName, String),
}

/// A derivation: a build recipe with named outputs, input store objects
/// and inputs that are themselves derivation outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicDerivation {
    pub name: StorePathName,
    pub outputs: BTreeMap<OutputName, DerivationOutput>,
    #[serde(default)]
    pub input_srcs: StorePathSet,
    #[serde(default)]
    pub input_drvs: BTreeMap<StorePath, BTreeSet<OutputName>>,
    pub platform: String,
    pub builder: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl BasicDerivation {
    pub fn r#type(&self) -> Result<DerivationType, DerivationError> {
        let mut ty: Option<DerivationType> = None;
        for output in self.outputs.values() {
            let this = match output {
                DerivationOutput::InputAddressed(_) => {
                    DerivationType::InputAddressed { deferred: false }
                }
                DerivationOutput::Deferred => DerivationType::InputAddressed { deferred: true },
                DerivationOutput::CAFixed(_) => DerivationType::ContentAddressed { fixed: true },
                DerivationOutput::CAFloating { .. } => {
                    DerivationType::ContentAddressed { fixed: false }
                }
                DerivationOutput::Impure { .. } => DerivationType::Impure,
            };
            match ty {
                None => ty = Some(this),
                Some(prev) if prev == this => {}
                // deferred and non-deferred input-addressed outputs may mix
                Some(DerivationType::InputAddressed { .. })
                    if matches!(this, DerivationType::InputAddressed { .. }) =>
                {
                    ty = Some(DerivationType::InputAddressed { deferred: true });
                }
                Some(_) => return Err(DerivationError::MixedOutputs(self.name.clone())),
            }
        }
        ty.ok_or_else(|| DerivationError::NoOutputs(self.name.clone()))
    }

    /// The names selected by `spec`, erroring on explicitly named outputs
    /// the derivation does not have.
    pub fn wanted_output_names(
        &self,
        spec: &OutputSpec,
    ) -> Result<BTreeSet<OutputName>, DerivationError> {
        match spec {
            OutputSpec::All => Ok(self.outputs.keys().cloned().collect()),
            OutputSpec::Named(names) => {
                for name in names {
                    if !self.outputs.contains_key(name) {
                        return Err(DerivationError::NoSuchOutput(
                            self.name.clone(),
                            name.clone(),
                        ));
                    }
                }
                Ok(names.clone())
            }
        }
    }

    pub fn output_path(
        &self,
        store_dir: &StoreDir,
        output_name: &OutputName,
    ) -> Result<Option<StorePath>, DerivationError> {
        let output = self
            .outputs
            .get(output_name)
            .ok_or_else(|| DerivationError::NoSuchOutput(self.name.clone(), output_name.clone()))?;
        Ok(output.path(store_dir, &self.name, output_name)?)
    }

    /// A stable per-output identity hash, independent of whether the
    /// concrete output path is known yet. Fixed outputs hash their content
    /// address; everything else hashes the derivation with output paths
    /// masked out.
    pub fn static_output_hashes(
        &self,
        store_dir: &StoreDir,
    ) -> Result<BTreeMap<OutputName, Hash>, DerivationError> {
        let mut hashes = BTreeMap::new();
        if self.r#type()?.is_fixed_output() {
            for (output_name, output) in &self.outputs {
                let DerivationOutput::CAFixed(ca) = output else {
                    return Err(DerivationError::MixedOutputs(self.name.clone()));
                };
                let path = output
                    .path(store_dir, &self.name, output_name)?
                    .ok_or_else(|| DerivationError::MixedOutputs(self.name.clone()))?;
                let fingerprint = format!(
                    "fixed:out:{}{}:{}",
                    match ca.method {
                        ContentAddressMethod::Recursive => "r:",
                        _ => "",
                    },
                    ca.hash,
                    store_dir.display_path(&path)
                );
                hashes.insert(output_name.clone(), Hash::sha256_of(fingerprint.as_bytes()));
            }
            return Ok(hashes);
        }
        let masked = self.masked()?;
        for output_name in self.outputs.keys() {
            let fingerprint = format!("{}:{}", masked.to_base32(), output_name);
            hashes.insert(output_name.clone(), Hash::sha256_of(fingerprint.as_bytes()));
        }
        Ok(hashes)
    }

    fn masked(&self) -> Result<Hash, DerivationError> {
        let mut masked = self.clone();
        for output in masked.outputs.values_mut() {
            if let DerivationOutput::InputAddressed(_) = output {
                *output = DerivationOutput::Deferred;
            }
        }
        let json = serde_json::to_vec(&masked)
            .map_err(|e| DerivationError::Serialize(self.name.clone(), e.to_string()))?;
        Ok(Hash::sha256_of(&json))
    }

    /// Rewrites this derivation into an equivalent one whose inputs are all
    /// concrete store paths: derivation inputs dissolve into `input_srcs`,
    /// placeholders in env and args are replaced by the given paths, and
    /// deferred outputs become input-addressed. Returns `None` if a needed
    /// input path is missing from `inputs`.
    pub fn try_resolve(
        &self,
        store_dir: &StoreDir,
        inputs: &BTreeMap<(StorePath, OutputName), StorePath>,
    ) -> Result<Option<BasicDerivation>, DerivationError> {
        let mut resolved = self.clone();
        let mut rewrites = Vec::new();
        for (input_drv, output_names) in std::mem::take(&mut resolved.input_drvs) {
            for output_name in output_names {
                let Some(path) = inputs.get(&(input_drv.clone(), output_name.clone())) else {
                    return Ok(None);
                };
                rewrites.push((
                    unknown_ca_output_placeholder(&input_drv, &output_name)?,
                    store_dir.display_path(path),
                ));
                resolved.input_srcs.insert(path.clone());
            }
        }
        for (from, to) in &rewrites {
            for value in resolved.env.values_mut() {
                *value = value.replace(from.as_str(), to);
            }
            for arg in &mut resolved.args {
                *arg = arg.replace(from.as_str(), to);
            }
        }
        let needs_paths = resolved
            .outputs
            .values()
            .any(|o| matches!(o, DerivationOutput::Deferred));
        if needs_paths {
            let hashes = resolved.static_output_hashes(store_dir)?;
            for (output_name, output) in &mut resolved.outputs {
                if let DerivationOutput::Deferred = output {
                    let name: StorePathName = OutputPathName {
                        drv_name: &resolved.name,
                        output_name,
                    }
                    .to_string()
                    .parse()?;
                    let path =
                        store_dir.make_output_path(output_name.as_str(), &hashes[output_name], &name);
                    *output = DerivationOutput::InputAddressed(path);
                }
            }
        }
        Ok(Some(resolved))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, DerivationError> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| DerivationError::Serialize(self.name.clone(), e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// The placeholder string a builder sees for one of its own
/// not-yet-known output paths.
pub fn hash_placeholder(output_name: &OutputName) -> String {
    let hash = Hash::sha256_of(format!("nix-output:{output_name}").as_bytes());
    format!("/{}", base32::encode(hash.digest()))
}

/// The placeholder for an unresolved content-addressed output of an
/// input derivation.
pub fn unknown_ca_output_placeholder(
    drv_path: &StorePath,
    output_name: &OutputName,
) -> Result<String, StorePathNameError> {
    let drv_name = drv_path.derivation_name()?;
    let clear = format!(
        "nix-upstream-output:{}:{}",
        base32::encode(drv_path.digest()),
        OutputPathName {
            drv_name: &drv_name,
            output_name,
        }
    );
    let hash = Hash::sha256_of(clear.as_bytes());
    Ok(format!("/{}", base32::encode(hash.digest())))
}
