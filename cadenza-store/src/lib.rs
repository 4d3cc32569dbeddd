// SPDX-License-Identifier: MIT

//! Abstract store access.
//!
//! The scheduler in `cadenza-scheduler` is written against the [`Store`]
//! trait defined here. [`MemoryStore`] is a complete hermetic
//! implementation used by the test suite and by embedders that do not
//! need persistence.

pub mod error;
pub mod memory;
pub mod path_info;
pub mod store;

pub use error::StoreError;
pub use memory::{MemoryStore, StoreConfig};
pub use path_info::PathInfo;
pub use store::{Store, copy_store_path, write_derivation};
