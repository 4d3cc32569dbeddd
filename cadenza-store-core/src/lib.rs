// SPDX-License-Identifier: MIT

//! Pure store semantics.
//!
//! This crate provides the fundamental types for working with a
//! content-addressed software store: store paths, hashes, derivations,
//! derived paths, realisations and build results. It is intentionally
//! IO-free - all operations are pure functions on values.

pub mod base32;
pub mod build;
pub mod content_address;
pub mod derivation;
pub mod derived_path;
pub mod hash;
pub mod realisation;
pub mod signature;
pub mod store_path;

pub use build::{BuildMode, BuildResult, BuildStatus, KeyedBuildResult};
pub use content_address::{ContentAddress, ContentAddressMethod};
pub use derivation::{BasicDerivation, DerivationOutput, DerivationType};
pub use derived_path::{DerivedPath, OutputName, OutputSpec};
pub use hash::{Hash, HashAlgo};
pub use realisation::{DrvOutput, Realisation};
pub use signature::Signature;
pub use store_path::{StoreDir, StorePath, StorePathName};
