// SPDX-License-Identifier: MIT

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use cadenza_store_core::store_path::StorePathSet;
use cadenza_store_core::{
    BasicDerivation, DrvOutput, Hash, Realisation, StoreDir, StorePath,
};
use tracing::debug;

use crate::error::StoreError;
use crate::path_info::PathInfo;

/// A store that can hold objects, derivations and realisations.
///
/// Implementations range from the in-memory reference store to remote
/// binary caches; the scheduler only ever sees `Arc<dyn Store>`.
#[async_trait]
pub trait Store: Send + Sync {
    fn store_dir(&self) -> &StoreDir;

    /// A human-readable identifier used in log messages and for
    /// tie-breaking substituter order.
    fn uri(&self) -> String;

    /// Substituter ordering; lower is preferred.
    fn priority(&self) -> u32 {
        0
    }

    /// Trusted stores may supply unsigned path info.
    fn is_trusted(&self) -> bool {
        false
    }

    /// Whether this store refuses unsigned path info from untrusted
    /// sources.
    fn requires_sigs(&self) -> bool {
        false
    }

    fn trusted_keys(&self) -> &[String] {
        &[]
    }

    /// Directory for lock files guarding modifications to this store.
    /// `None` for stores this process cannot lock (remote caches); such
    /// stores cannot be built into directly.
    fn lock_root(&self) -> Option<&Path> {
        None
    }

    async fn is_valid_path(&self, path: &StorePath) -> Result<bool, StoreError>;

    /// `Ok(None)` if the path is unknown to this store.
    async fn query_path_info(&self, path: &StorePath)
        -> Result<Option<PathInfo>, StoreError>;

    /// Protects a path from garbage collection for the lifetime of this
    /// process.
    async fn add_temp_root(&self, path: &StorePath) -> Result<(), StoreError>;

    /// The reference closure of a valid path, including the path itself.
    async fn compute_fs_closure(&self, path: &StorePath) -> Result<StorePathSet, StoreError>;

    async fn read_derivation(&self, path: &StorePath) -> Result<BasicDerivation, StoreError>;

    async fn add_to_store(
        &self,
        info: PathInfo,
        contents: Bytes,
        repair: bool,
    ) -> Result<(), StoreError>;

    /// Reads out an object for transfer to another store. May fail with
    /// [`StoreError::SubstituteGone`] if the object vanished since it was
    /// advertised.
    async fn export_path(&self, path: &StorePath) -> Result<(PathInfo, Bytes), StoreError>;

    /// Forgets a path, e.g. before re-adding it during repair.
    async fn invalidate_path(&self, path: &StorePath) -> Result<(), StoreError>;

    async fn query_realisation(
        &self,
        id: &DrvOutput,
    ) -> Result<Option<Realisation>, StoreError>;

    async fn register_drv_output(&self, realisation: &Realisation) -> Result<(), StoreError>;

    /// Whether the stored contents still match the registered NAR hash.
    async fn path_contents_good(&self, path: &StorePath) -> Result<bool, StoreError>;
}

/// Copies a single store object between stores, enforcing the
/// destination's signature policy.
pub async fn copy_store_path(
    src: &dyn Store,
    dst: &dyn Store,
    path: &StorePath,
    repair: bool,
    check_sigs: bool,
) -> Result<PathInfo, StoreError> {
    let (info, contents) = src.export_path(path).await?;
    if check_sigs
        && dst.requires_sigs()
        && !src.is_trusted()
        && !info.is_trustworthy(dst.trusted_keys())
    {
        return Err(StoreError::UntrustedPath {
            path: path.clone(),
            uri: src.uri(),
        });
    }
    debug!(path = %path, from = %src.uri(), "copying store path");
    dst.add_to_store(info.clone(), contents, repair).await?;
    Ok(info)
}

/// Serializes a derivation to its store path and writes it there, unless
/// it already exists. Returns the derivation's path.
pub async fn write_derivation(
    store: &dyn Store,
    drv: &BasicDerivation,
) -> Result<StorePath, StoreError> {
    let contents = drv
        .to_json()
        .map_err(|e| StoreError::Misc(e.to_string()))?;
    let name = format!("{}.drv", drv.name)
        .parse()
        .map_err(|e| StoreError::Misc(format!("bad derivation name: {e}")))?;
    let drv_path = store.store_dir().make_text_path(&name, &contents);
    if store.is_valid_path(&drv_path).await? {
        return Ok(drv_path);
    }
    let contents = Bytes::from(contents);
    let mut info = PathInfo::new(
        drv_path.clone(),
        Hash::sha256_of(&contents),
        contents.len() as u64,
    );
    info.ultimate = true;
    store.add_to_store(info, contents, false).await?;
    Ok(drv_path)
}
