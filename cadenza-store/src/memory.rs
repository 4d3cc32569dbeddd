// SPDX-License-Identifier: MIT

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use cadenza_store_core::store_path::StorePathSet;
use cadenza_store_core::{
    BasicDerivation, DrvOutput, Hash, Realisation, StoreDir, StorePath,
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::path_info::PathInfo;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub store_dir: StoreDir,
    pub uri: String,
    pub priority: u32,
    pub trusted: bool,
    pub require_sigs: bool,
    pub trusted_keys: Vec<String>,
    /// Where lock files live; `None` makes the store unlockable, like a
    /// remote cache.
    pub lock_root: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            store_dir: StoreDir::default(),
            uri: "memory://".into(),
            priority: 0,
            trusted: false,
            require_sigs: false,
            trusted_keys: Vec::new(),
            lock_root: None,
        }
    }
}

impl StoreConfig {
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_trusted(mut self, trusted: bool) -> Self {
        self.trusted = trusted;
        self
    }

    pub fn with_require_sigs(mut self, trusted_keys: Vec<String>) -> Self {
        self.require_sigs = true;
        self.trusted_keys = trusted_keys;
        self
    }

    pub fn with_lock_root(mut self, lock_root: impl Into<PathBuf>) -> Self {
        self.lock_root = Some(lock_root.into());
        self
    }

    pub fn with_store_dir(mut self, store_dir: StoreDir) -> Self {
        self.store_dir = store_dir;
        self
    }
}

struct Object {
    info: PathInfo,
    contents: Bytes,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<StorePath, Object>,
    realisations: BTreeMap<DrvOutput, Realisation>,
    temp_roots: BTreeSet<StorePath>,
    corrupt: BTreeSet<StorePath>,
    /// Paths still advertised but gone from the backing storage; reads
    /// fail with `SubstituteGone`.
    vanished: BTreeSet<StorePath>,
}

/// A complete in-memory store.
pub struct MemoryStore {
    config: StoreConfig,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        MemoryStore {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Seeds an object directly, for tests and fixtures.
    pub async fn add_object(&self, info: PathInfo, contents: impl Into<Bytes>) {
        let mut inner = self.inner.lock().await;
        let path = info.path.clone();
        inner.objects.insert(
            path,
            Object {
                info,
                contents: contents.into(),
            },
        );
    }

    /// Seeds an object with synthetic contents and no references.
    pub async fn add_simple_object(&self, path: &StorePath) -> PathInfo {
        let contents = Bytes::from(path.to_string());
        let info = PathInfo::new(
            path.clone(),
            Hash::sha256_of(&contents),
            contents.len() as u64,
        );
        self.add_object(info.clone(), contents).await;
        info
    }

    /// Writes a derivation to its text path and returns that path.
    pub async fn add_derivation(
        &self,
        drv: &BasicDerivation,
    ) -> Result<StorePath, StoreError> {
        crate::store::write_derivation(self, drv).await
    }

    /// Marks a path as corrupt: still registered, contents no longer
    /// match.
    pub async fn mark_corrupt(&self, path: &StorePath) {
        self.inner.lock().await.corrupt.insert(path.clone());
    }

    /// Makes future reads of the path fail with `SubstituteGone` while it
    /// stays advertised in path queries.
    pub async fn mark_vanished(&self, path: &StorePath) {
        self.inner.lock().await.vanished.insert(path.clone());
    }

    pub async fn temp_roots(&self) -> BTreeSet<StorePath> {
        self.inner.lock().await.temp_roots.clone()
    }

    pub async fn contents_of(&self, path: &StorePath) -> Option<Bytes> {
        self.inner
            .lock()
            .await
            .objects
            .get(path)
            .map(|o| o.contents.clone())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn store_dir(&self) -> &StoreDir {
        &self.config.store_dir
    }

    fn uri(&self) -> String {
        self.config.uri.clone()
    }

    fn priority(&self) -> u32 {
        self.config.priority
    }

    fn is_trusted(&self) -> bool {
        self.config.trusted
    }

    fn requires_sigs(&self) -> bool {
        self.config.require_sigs
    }

    fn trusted_keys(&self) -> &[String] {
        &self.config.trusted_keys
    }

    fn lock_root(&self) -> Option<&Path> {
        self.config.lock_root.as_deref()
    }

    async fn is_valid_path(&self, path: &StorePath) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.objects.contains_key(path))
    }

    async fn query_path_info(
        &self,
        path: &StorePath,
    ) -> Result<Option<PathInfo>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .objects
            .get(path)
            .map(|o| o.info.clone()))
    }

    async fn add_temp_root(&self, path: &StorePath) -> Result<(), StoreError> {
        self.inner.lock().await.temp_roots.insert(path.clone());
        Ok(())
    }

    async fn compute_fs_closure(&self, path: &StorePath) -> Result<StorePathSet, StoreError> {
        let inner = self.inner.lock().await;
        let mut closure = StorePathSet::new();
        let mut queue = VecDeque::from([path.clone()]);
        while let Some(next) = queue.pop_front() {
            if !closure.insert(next.clone()) {
                continue;
            }
            let object = inner
                .objects
                .get(&next)
                .ok_or_else(|| StoreError::InvalidPath(next.clone()))?;
            for reference in &object.info.references {
                if reference != &next {
                    queue.push_back(reference.clone());
                }
            }
        }
        Ok(closure)
    }

    async fn read_derivation(&self, path: &StorePath) -> Result<BasicDerivation, StoreError> {
        let contents = {
            let inner = self.inner.lock().await;
            if inner.vanished.contains(path) {
                return Err(StoreError::SubstituteGone(path.clone()));
            }
            inner
                .objects
                .get(path)
                .map(|o| o.contents.clone())
                .ok_or_else(|| StoreError::InvalidPath(path.clone()))?
        };
        BasicDerivation::from_json(&contents)
            .map_err(|e| StoreError::BadDerivation(path.clone(), e))
    }

    async fn add_to_store(
        &self,
        info: PathInfo,
        contents: Bytes,
        repair: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let path = info.path.clone();
        if repair {
            inner.corrupt.remove(&path);
            inner.vanished.remove(&path);
        } else if inner.objects.contains_key(&path) && !inner.corrupt.contains(&path) {
            debug!(path = %path, "already valid, not overwriting");
            return Ok(());
        }
        inner.corrupt.remove(&path);
        inner.objects.insert(path, Object { info, contents });
        Ok(())
    }

    async fn export_path(&self, path: &StorePath) -> Result<(PathInfo, Bytes), StoreError> {
        let inner = self.inner.lock().await;
        if inner.vanished.contains(path) {
            return Err(StoreError::SubstituteGone(path.clone()));
        }
        inner
            .objects
            .get(path)
            .map(|o| (o.info.clone(), o.contents.clone()))
            .ok_or_else(|| StoreError::InvalidPath(path.clone()))
    }

    async fn invalidate_path(&self, path: &StorePath) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.objects.remove(path);
        inner.corrupt.remove(path);
        inner.vanished.remove(path);
        Ok(())
    }

    async fn query_realisation(
        &self,
        id: &DrvOutput,
    ) -> Result<Option<Realisation>, StoreError> {
        Ok(self.inner.lock().await.realisations.get(id).cloned())
    }

    async fn register_drv_output(&self, realisation: &Realisation) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .realisations
            .insert(realisation.id.clone(), realisation.clone());
        Ok(())
    }

    async fn path_contents_good(&self, path: &StorePath) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        if !inner.objects.contains_key(path) {
            return Err(StoreError::InvalidPath(path.clone()));
        }
        Ok(!inner.corrupt.contains(path))
    }
}
