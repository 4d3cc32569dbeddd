// SPDX-License-Identifier: MIT

//! End-to-end realisation scenarios against the in-memory store.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cadenza_scheduler::builder::{BuildContext, BuildOutcome, BuiltOutput, FailureReason};
use cadenza_scheduler::{DerivationBuilder, Realiser, SchedulerError, SchedulerSettings};
use cadenza_store::{MemoryStore, PathInfo, Store, StoreConfig, StoreError};
use cadenza_store_core::store_path::StorePathSet;
use cadenza_store_core::{
    BasicDerivation, BuildMode, BuildStatus, ContentAddress, ContentAddressMethod,
    DerivationOutput, DerivedPath, DrvOutput, Hash, HashAlgo, OutputSpec, Realisation, StoreDir,
    StorePath,
};

#[derive(Clone)]
enum Plan {
    Succeed { delay: Duration },
    Produce(BTreeMap<String, Bytes>),
    Fail(FailureReason),
}

/// A builder that follows a per-derivation script and records what it
/// was asked to build.
struct ScriptedBuilder {
    plans: std::sync::Mutex<BTreeMap<String, Plan>>,
    calls: std::sync::Mutex<Vec<String>>,
}

impl ScriptedBuilder {
    fn new() -> Arc<Self> {
        Arc::new(ScriptedBuilder {
            plans: std::sync::Mutex::new(BTreeMap::new()),
            calls: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn plan(&self, name: &str, plan: Plan) {
        self.plans.lock().unwrap().insert(name.to_string(), plan);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DerivationBuilder for ScriptedBuilder {
    async fn build(&self, ctx: BuildContext<'_>) -> Result<BuildOutcome, SchedulerError> {
        let name = ctx.drv.name.to_string();
        self.calls.lock().unwrap().push(name.clone());
        let plan = self
            .plans
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or(Plan::Succeed {
                delay: Duration::ZERO,
            });
        match plan {
            Plan::Succeed { delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let outputs = ctx
                    .drv
                    .outputs
                    .keys()
                    .map(|output| {
                        (output.clone(), BuiltOutput {
                            contents: Bytes::from(format!("{name}:{output}")),
                            references: ctx.input_paths.clone(),
                        })
                    })
                    .collect();
                Ok(BuildOutcome::Success { outputs })
            }
            Plan::Produce(contents) => {
                let outputs = ctx
                    .drv
                    .outputs
                    .keys()
                    .map(|output| {
                        (output.clone(), BuiltOutput {
                            contents: contents
                                .get(output.as_str())
                                .cloned()
                                .unwrap_or_else(|| Bytes::from("missing")),
                            references: ctx.input_paths.clone(),
                        })
                    })
                    .collect();
                Ok(BuildOutcome::Success { outputs })
            }
            Plan::Fail(reason) => Ok(BuildOutcome::Failure {
                reason,
                log_tail: vec!["scripted failure".into()],
            }),
        }
    }
}

/// Wraps a store to count exports and optionally make them fail, for
/// observing substituter traffic.
struct ObservedStore {
    inner: MemoryStore,
    exports: AtomicUsize,
    fail_exports: bool,
}

impl ObservedStore {
    fn new(inner: MemoryStore, fail_exports: bool) -> Arc<Self> {
        Arc::new(ObservedStore {
            inner,
            exports: AtomicUsize::new(0),
            fail_exports,
        })
    }

    fn export_count(&self) -> usize {
        self.exports.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for ObservedStore {
    fn store_dir(&self) -> &StoreDir {
        self.inner.store_dir()
    }
    fn uri(&self) -> String {
        self.inner.uri()
    }
    fn priority(&self) -> u32 {
        self.inner.priority()
    }
    fn is_trusted(&self) -> bool {
        self.inner.is_trusted()
    }
    fn requires_sigs(&self) -> bool {
        self.inner.requires_sigs()
    }
    fn trusted_keys(&self) -> &[String] {
        self.inner.trusted_keys()
    }
    fn lock_root(&self) -> Option<&Path> {
        self.inner.lock_root()
    }
    async fn is_valid_path(&self, path: &StorePath) -> Result<bool, StoreError> {
        self.inner.is_valid_path(path).await
    }
    async fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>, StoreError> {
        self.inner.query_path_info(path).await
    }
    async fn add_temp_root(&self, path: &StorePath) -> Result<(), StoreError> {
        self.inner.add_temp_root(path).await
    }
    async fn compute_fs_closure(&self, path: &StorePath) -> Result<StorePathSet, StoreError> {
        self.inner.compute_fs_closure(path).await
    }
    async fn read_derivation(&self, path: &StorePath) -> Result<BasicDerivation, StoreError> {
        self.inner.read_derivation(path).await
    }
    async fn add_to_store(
        &self,
        info: PathInfo,
        contents: Bytes,
        repair: bool,
    ) -> Result<(), StoreError> {
        self.inner.add_to_store(info, contents, repair).await
    }
    async fn export_path(&self, path: &StorePath) -> Result<(PathInfo, Bytes), StoreError> {
        self.exports.fetch_add(1, Ordering::SeqCst);
        if self.fail_exports {
            return Err(StoreError::Misc("transfer failed".into()));
        }
        self.inner.export_path(path).await
    }
    async fn invalidate_path(&self, path: &StorePath) -> Result<(), StoreError> {
        self.inner.invalidate_path(path).await
    }
    async fn query_realisation(&self, id: &DrvOutput) -> Result<Option<Realisation>, StoreError> {
        self.inner.query_realisation(id).await
    }
    async fn register_drv_output(&self, realisation: &Realisation) -> Result<(), StoreError> {
        self.inner.register_drv_output(realisation).await
    }
    async fn path_contents_good(&self, path: &StorePath) -> Result<bool, StoreError> {
        self.inner.path_contents_good(path).await
    }
}

fn fixture_path(digit: char, name: &str) -> StorePath {
    format!("{}-{name}", digit.to_string().repeat(32))
        .parse()
        .unwrap()
}

fn drv_skeleton(name: &str) -> BasicDerivation {
    BasicDerivation {
        name: name.parse().unwrap(),
        outputs: BTreeMap::new(),
        input_srcs: Default::default(),
        input_drvs: BTreeMap::new(),
        platform: "x86_64-linux".into(),
        builder: "/bin/sh".into(),
        args: vec![],
        env: BTreeMap::new(),
    }
}

/// An input-addressed derivation with a single `out` path.
fn ia_drv(name: &str, out_digit: char) -> (BasicDerivation, StorePath) {
    let out_path = fixture_path(out_digit, name);
    let mut drv = drv_skeleton(name);
    drv.outputs.insert(
        "out".parse().unwrap(),
        DerivationOutput::InputAddressed(out_path.clone()),
    );
    (drv, out_path)
}

fn floating_drv(name: &str) -> BasicDerivation {
    let mut drv = drv_skeleton(name);
    drv.outputs.insert(
        "out".parse().unwrap(),
        DerivationOutput::CAFloating {
            method: ContentAddressMethod::Recursive,
            hash_algo: HashAlgo::Sha256,
        },
    );
    drv
}

fn want(drv_path: &StorePath) -> DerivedPath {
    DerivedPath::Built {
        drv_path: drv_path.clone(),
        outputs: OutputSpec::All,
    }
}

#[test_log::test(tokio::test)]
async fn builds_then_accepts_as_already_valid() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    let (drv, out_path) = ia_drv("hello-1.0", '0');
    let drv_path = store.add_derivation(&drv).await.unwrap();
    let realiser = Realiser::new(store.clone(), builder.clone());

    let result = realiser
        .build_derivation(&drv_path, &drv, OutputSpec::All, BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::Built);
    assert!(store.is_valid_path(&out_path).await.unwrap());
    assert_eq!(builder.calls(), vec!["hello-1.0"]);

    // a second run must not rebuild
    let result = realiser
        .build_derivation(&drv_path, &drv, OutputSpec::All, BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::AlreadyValid);
    assert_eq!(builder.calls().len(), 1);
}

#[test_log::test(tokio::test)]
async fn substitutes_instead_of_building() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let cache = MemoryStore::new(StoreConfig::default().with_uri("memory://cache"));
    let builder = ScriptedBuilder::new();
    let (drv, out_path) = ia_drv("hello-1.0", '0');
    let drv_path = store.add_derivation(&drv).await.unwrap();
    cache.add_simple_object(&out_path).await;
    let cache = ObservedStore::new(cache, false);

    let realiser =
        Realiser::new(store.clone(), builder.clone()).with_substituters(vec![cache.clone()]);
    let result = realiser
        .build_derivation(&drv_path, &drv, OutputSpec::All, BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::Substituted);
    assert!(store.is_valid_path(&out_path).await.unwrap());
    assert!(builder.calls().is_empty());
    assert_eq!(cache.export_count(), 1);
}

#[test_log::test(tokio::test)]
async fn substitution_pulls_the_reference_closure_first() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let cache = MemoryStore::new(StoreConfig::default().with_uri("memory://cache"));
    let dep = fixture_path('1', "dep");
    let top = fixture_path('0', "top");
    cache.add_simple_object(&dep).await;
    let mut info = cache.add_simple_object(&top).await;
    info.references.insert(dep.clone());
    cache.add_object(info, Bytes::from("top")).await;
    let cache = ObservedStore::new(cache, false);

    let realiser = Realiser::new(store.clone(), ScriptedBuilder::new())
        .with_substituters(vec![cache.clone()]);
    realiser.ensure_path(&top).await.unwrap();
    assert!(store.is_valid_path(&dep).await.unwrap());
    assert!(store.is_valid_path(&top).await.unwrap());
    assert_eq!(cache.export_count(), 2);
}

#[test_log::test(tokio::test)]
async fn duplicate_requests_substitute_once() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let cache = MemoryStore::new(StoreConfig::default().with_uri("memory://cache"));
    let path = fixture_path('0', "shared");
    cache.add_simple_object(&path).await;
    let cache = ObservedStore::new(cache, false);

    let realiser = Realiser::new(store.clone(), ScriptedBuilder::new())
        .with_substituters(vec![cache.clone()]);
    realiser
        .build_paths(
            &[
                DerivedPath::Opaque(path.clone()),
                DerivedPath::Opaque(path.clone()),
            ],
            BuildMode::Normal,
        )
        .await
        .unwrap();
    assert_eq!(cache.export_count(), 1);
}

#[test_log::test(tokio::test)]
async fn failed_substitute_stops_without_fallback() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    let (drv, out_path) = ia_drv("hello-1.0", '0');
    let drv_path = store.add_derivation(&drv).await.unwrap();
    let cache = MemoryStore::new(StoreConfig::default().with_uri("memory://cache"));
    cache.add_simple_object(&out_path).await;
    let cache = ObservedStore::new(cache, true);

    let realiser =
        Realiser::new(store.clone(), builder.clone()).with_substituters(vec![cache.clone()]);
    let result = realiser
        .build_derivation(&drv_path, &drv, OutputSpec::All, BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::TransientFailure);
    assert!(builder.calls().is_empty());
}

#[test_log::test(tokio::test)]
async fn failed_substitute_falls_back_when_enabled() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    let (drv, out_path) = ia_drv("hello-1.0", '0');
    let drv_path = store.add_derivation(&drv).await.unwrap();
    let cache = MemoryStore::new(StoreConfig::default().with_uri("memory://cache"));
    cache.add_simple_object(&out_path).await;
    let cache = ObservedStore::new(cache, true);

    let settings = SchedulerSettings {
        try_fallback: true,
        ..SchedulerSettings::default()
    };
    let realiser = Realiser::new(store.clone(), builder.clone())
        .with_substituters(vec![cache])
        .with_settings(settings);
    let result = realiser
        .build_derivation(&drv_path, &drv, OutputSpec::All, BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::Built);
    assert!(store.is_valid_path(&out_path).await.unwrap());
    assert_eq!(builder.calls(), vec!["hello-1.0"]);
}

#[test_log::test(tokio::test)]
async fn incomplete_closure_substitution_retries_after_inputs() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    let (dep_drv, dep_out) = ia_drv("dep-1.0", '1');
    let dep_drv_path = store.add_derivation(&dep_drv).await.unwrap();
    let (mut top_drv, top_out) = ia_drv("top-1.0", '0');
    top_drv
        .input_drvs
        .insert(dep_drv_path.clone(), ["out".parse().unwrap()].into());
    let top_drv_path = store.add_derivation(&top_drv).await.unwrap();

    // the cache carries top's output, which references dep, but has no
    // dep itself; only building dep locally completes the closure
    let cache = MemoryStore::new(StoreConfig::default().with_uri("memory://cache"));
    let mut info = cache.add_simple_object(&top_out).await;
    info.references.insert(dep_out.clone());
    cache.add_object(info, Bytes::from("top")).await;
    let cache = ObservedStore::new(cache, false);

    let realiser = Realiser::new(store.clone(), builder.clone())
        .with_substituters(vec![cache.clone()]);
    let result = realiser
        .build_derivation(&top_drv_path, &top_drv, OutputSpec::All, BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::Substituted);
    assert!(store.is_valid_path(&top_out).await.unwrap());
    // dep was built, top came from the cache on the second attempt
    assert_eq!(builder.calls(), vec!["dep-1.0"]);
    assert_eq!(cache.export_count(), 1);
}

#[test_log::test(tokio::test)]
async fn dependency_failure_propagates_with_exit_status() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    builder.plan("dep-1.0", Plan::Fail(FailureReason::Exit(1)));
    let (dep_drv, dep_out) = ia_drv("dep-1.0", '1');
    let dep_drv_path = store.add_derivation(&dep_drv).await.unwrap();
    let (mut top_drv, _) = ia_drv("top-1.0", '0');
    top_drv
        .input_drvs
        .insert(dep_drv_path, ["out".parse().unwrap()].into());
    let top_drv_path = store.add_derivation(&top_drv).await.unwrap();

    let realiser = Realiser::new(store.clone(), builder.clone());
    let err = realiser
        .build_paths(&[want(&top_drv_path)], BuildMode::Normal)
        .await
        .unwrap_err();
    match err {
        SchedulerError::BuildsFailed {
            failed,
            exit_status,
        } => {
            assert_eq!(failed.len(), 1);
            // permanent build failure: 0x60 | 0x04
            assert_eq!(exit_status, 0x64);
        }
        other => panic!("expected BuildsFailed, got {other}"),
    }
    let results = realiser
        .build_paths_with_results(&[want(&top_drv_path)], BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(results[0].result.status, BuildStatus::DependencyFailed);
    assert!(!store.is_valid_path(&dep_out).await.unwrap());
}

#[test_log::test(tokio::test)]
async fn widened_outputs_are_all_realised_by_one_build() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    let mut drv = drv_skeleton("multi-1.0");
    let out = fixture_path('0', "multi-1.0");
    let doc = fixture_path('1', "multi-1.0-doc");
    drv.outputs.insert(
        "out".parse().unwrap(),
        DerivationOutput::InputAddressed(out.clone()),
    );
    drv.outputs.insert(
        "doc".parse().unwrap(),
        DerivationOutput::InputAddressed(doc.clone()),
    );
    let drv_path = store.add_derivation(&drv).await.unwrap();

    let realiser = Realiser::new(store.clone(), builder.clone());
    realiser
        .build_paths(
            &[
                DerivedPath::Built {
                    drv_path: drv_path.clone(),
                    outputs: "out".parse().unwrap(),
                },
                DerivedPath::Built {
                    drv_path: drv_path.clone(),
                    outputs: "doc".parse().unwrap(),
                },
            ],
            BuildMode::Normal,
        )
        .await
        .unwrap();
    assert!(store.is_valid_path(&out).await.unwrap());
    assert!(store.is_valid_path(&doc).await.unwrap());
    assert_eq!(builder.calls().len(), 1);
}

#[test_log::test(tokio::test)]
async fn fixed_output_hash_mismatch_is_rejected() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    builder.plan(
        "fetched-1.0",
        Plan::Produce(BTreeMap::from([("out".to_string(), Bytes::from("wrong"))])),
    );
    let mut drv = drv_skeleton("fetched-1.0");
    drv.outputs.insert(
        "out".parse().unwrap(),
        DerivationOutput::CAFixed(ContentAddress {
            method: ContentAddressMethod::Flat,
            hash: Hash::sha256_of(b"expected contents"),
        }),
    );
    let drv_path = store.add_derivation(&drv).await.unwrap();

    let realiser = Realiser::new(store.clone(), builder.clone());
    let err = realiser
        .build_paths(&[want(&drv_path)], BuildMode::Normal)
        .await
        .unwrap_err();
    match err {
        SchedulerError::BuildsFailed { exit_status, .. } => {
            // hash mismatch: 0x60 | 0x04 | 0x02
            assert_eq!(exit_status, 0x66);
        }
        other => panic!("expected BuildsFailed, got {other}"),
    }

    builder.plan(
        "fetched-1.0",
        Plan::Produce(BTreeMap::from([(
            "out".to_string(),
            Bytes::from("expected contents"),
        )])),
    );
    let result = realiser
        .build_derivation(&drv_path, &drv, OutputSpec::All, BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::Built);
}

#[test_log::test(tokio::test)]
async fn floating_outputs_resolve_through_the_realisation_registry() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    let drv = floating_drv("floaty-1.0");
    let drv_path = store.add_derivation(&drv).await.unwrap();

    let realiser = Realiser::new(store.clone(), builder.clone());
    let result = realiser
        .build_derivation(&drv_path, &drv, OutputSpec::All, BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::Built);
    let out: cadenza_store_core::OutputName = "out".parse().unwrap();
    let out_path = result.built_outputs[&out].out_path.clone();
    assert!(store.is_valid_path(&out_path).await.unwrap());

    // the registry remembers the mapping, so the next run accepts it
    let result = realiser
        .build_derivation(&drv_path, &drv, OutputSpec::All, BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::AlreadyValid);
    assert_eq!(builder.calls().len(), 1);
}

#[test_log::test(tokio::test)]
async fn deferred_outputs_build_via_the_resolved_derivation() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    let dep = floating_drv("dep-1.0");
    let dep_path = store.add_derivation(&dep).await.unwrap();

    let mut top = drv_skeleton("top-1.0");
    top.outputs
        .insert("out".parse().unwrap(), DerivationOutput::Deferred);
    top.input_drvs
        .insert(dep_path.clone(), ["out".parse().unwrap()].into());
    let top_path = store.add_derivation(&top).await.unwrap();

    let realiser = Realiser::new(store.clone(), builder.clone());
    let result = realiser
        .build_derivation(&top_path, &top, OutputSpec::All, BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::Built);
    let out: cadenza_store_core::OutputName = "out".parse().unwrap();
    assert!(
        store
            .is_valid_path(&result.built_outputs[&out].out_path)
            .await
            .unwrap()
    );
    // dep, then top under its resolved identity
    assert_eq!(builder.calls(), vec!["dep-1.0", "top-1.0"]);

    // a later run finds the registered realisation straight away
    let result = realiser
        .build_derivation(&top_path, &top, OutputSpec::All, BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::AlreadyValid);
    assert_eq!(builder.calls().len(), 2);
}

#[test_log::test(tokio::test)]
async fn resolving_to_prebuilt_outputs_is_reported_as_such() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    let dep = floating_drv("dep-1.0");
    let dep_path = store.add_derivation(&dep).await.unwrap();

    let out: cadenza_store_core::OutputName = "out".parse().unwrap();
    let mut top = drv_skeleton("top-1.0");
    top.outputs.insert(out.clone(), DerivationOutput::Deferred);
    top.input_drvs
        .insert(dep_path.clone(), [out.clone()].into());
    let top_path = store.add_derivation(&top).await.unwrap();

    let realiser = Realiser::new(store.clone(), builder.clone());
    let dep_result = realiser
        .build_derivation(&dep_path, &dep, OutputSpec::All, BuildMode::Normal)
        .await
        .unwrap();
    let dep_out = dep_result.built_outputs[&out].out_path.clone();

    // build what `top` resolves to, before `top` itself is requested
    let inputs = BTreeMap::from([((dep_path.clone(), out.clone()), dep_out)]);
    let resolved = top
        .try_resolve(store.store_dir(), &inputs)
        .unwrap()
        .expect("all inputs are known");
    let resolved_path = store.add_derivation(&resolved).await.unwrap();
    realiser
        .build_paths(&[want(&resolved_path)], BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(builder.calls().len(), 2);

    let result = realiser
        .build_derivation(&top_path, &top, OutputSpec::All, BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::ResolvesToAlreadyValid);
    assert_eq!(builder.calls().len(), 2);
}

#[test_log::test(tokio::test)]
async fn realisations_substitute_for_floating_outputs() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    let drv = floating_drv("floaty-1.0");
    let drv_path = store.add_derivation(&drv).await.unwrap();

    let out: cadenza_store_core::OutputName = "out".parse().unwrap();
    let static_hash = drv
        .static_output_hashes(store.store_dir())
        .unwrap()
        .remove(&out)
        .unwrap();
    let id = DrvOutput {
        drv_hash: static_hash,
        output_name: out.clone(),
    };
    let out_path = fixture_path('2', "floaty-1.0");
    let cache = MemoryStore::new(StoreConfig::default().with_uri("memory://cache"));
    cache.add_simple_object(&out_path).await;
    cache
        .register_drv_output(&Realisation::new(id.clone(), out_path.clone()))
        .await
        .unwrap();
    let cache = ObservedStore::new(cache, false);

    let realiser =
        Realiser::new(store.clone(), builder.clone()).with_substituters(vec![cache]);
    let result = realiser
        .build_derivation(&drv_path, &drv, OutputSpec::All, BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::Substituted);
    assert!(store.is_valid_path(&out_path).await.unwrap());
    assert!(store.query_realisation(&id).await.unwrap().is_some());
    assert!(builder.calls().is_empty());
}

#[test_log::test(tokio::test)]
async fn repair_rebuilds_from_the_deriver() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    let (drv, out_path) = ia_drv("hello-1.0", '0');
    let drv_path = store.add_derivation(&drv).await.unwrap();

    let realiser = Realiser::new(store.clone(), builder.clone());
    realiser
        .build_paths(&[want(&drv_path)], BuildMode::Normal)
        .await
        .unwrap();

    store.mark_corrupt(&out_path).await;
    assert!(!store.path_contents_good(&out_path).await.unwrap());
    realiser.repair_path(&out_path).await.unwrap();
    assert!(store.path_contents_good(&out_path).await.unwrap());
    assert_eq!(builder.calls().len(), 2);
}

#[test_log::test(tokio::test)]
async fn repair_restores_corrupt_paths_in_the_output_closure() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    let dep = fixture_path('1', "dep");
    store.add_simple_object(&dep).await;
    let (drv, out_path) = ia_drv("hello-1.0", '0');
    let drv_path = store.add_derivation(&drv).await.unwrap();
    let mut info = store.add_simple_object(&out_path).await;
    info.references.insert(dep.clone());
    store.add_object(info, Bytes::from("out")).await;

    // the output itself is fine, a path it references is not
    store.mark_corrupt(&dep).await;
    let cache = MemoryStore::new(StoreConfig::default().with_uri("memory://cache"));
    cache.add_simple_object(&dep).await;
    let cache = ObservedStore::new(cache, false);

    let realiser = Realiser::new(store.clone(), builder.clone())
        .with_substituters(vec![cache.clone()]);
    realiser
        .build_paths(&[want(&drv_path)], BuildMode::Repair)
        .await
        .unwrap();
    assert!(store.path_contents_good(&dep).await.unwrap());
    assert_eq!(cache.export_count(), 1);
    assert!(builder.calls().is_empty());
}

#[test_log::test(tokio::test)]
async fn repair_rebuilds_corrupt_closure_members_from_their_deriver() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    let (dep_drv, dep_out) = ia_drv("dep-1.0", '1');
    let dep_drv_path = store.add_derivation(&dep_drv).await.unwrap();
    let (mut top_drv, _) = ia_drv("top-1.0", '0');
    top_drv
        .input_drvs
        .insert(dep_drv_path.clone(), ["out".parse().unwrap()].into());
    let top_drv_path = store.add_derivation(&top_drv).await.unwrap();

    let realiser = Realiser::new(store.clone(), builder.clone());
    realiser
        .build_paths(&[want(&top_drv_path)], BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(builder.calls(), vec!["dep-1.0", "top-1.0"]);

    // no substituters: the corrupt dependency can only be rebuilt
    store.mark_corrupt(&dep_out).await;
    realiser
        .build_paths(&[want(&top_drv_path)], BuildMode::Repair)
        .await
        .unwrap();
    assert!(store.path_contents_good(&dep_out).await.unwrap());
    assert_eq!(builder.calls(), vec!["dep-1.0", "top-1.0", "dep-1.0"]);
}

#[test_log::test(tokio::test)]
async fn repair_without_deriver_or_substituter_fails() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let orphan = fixture_path('3', "orphan");
    store.add_simple_object(&orphan).await;
    store.mark_corrupt(&orphan).await;

    let realiser = Realiser::new(store.clone(), ScriptedBuilder::new());
    let err = realiser.repair_path(&orphan).await.unwrap_err();
    assert!(matches!(err, SchedulerError::CannotRepair(_)));
}

#[test_log::test(tokio::test)]
async fn ensure_path_fails_without_substituters() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let missing = fixture_path('4', "missing");
    let realiser = Realiser::new(store, ScriptedBuilder::new());
    let err = realiser.ensure_path(&missing).await.unwrap_err();
    assert!(matches!(err, SchedulerError::CannotSubstitute(_)));
}

#[test_log::test(tokio::test)]
async fn contending_schedulers_build_once_via_path_locks() {
    let lock_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(
        StoreConfig::default().with_lock_root(lock_dir.path()),
    ));
    let slow = ScriptedBuilder::new();
    slow.plan("locked-1.0", Plan::Succeed {
        delay: Duration::from_millis(400),
    });
    let fast = ScriptedBuilder::new();
    let (drv, out_path) = ia_drv("locked-1.0", '0');
    let drv_path = store.add_derivation(&drv).await.unwrap();

    let settings = SchedulerSettings {
        lock_poll_interval: Duration::from_millis(50),
        ..SchedulerSettings::default()
    };
    let first = Realiser::new(store.clone(), slow.clone()).with_settings(settings.clone());
    let second = Realiser::new(store.clone(), fast.clone()).with_settings(settings);

    let req = vec![want(&drv_path)];
    let a = {
        let req = req.clone();
        async move { first.build_paths(&req, BuildMode::Normal).await }
    };
    let b = async move {
        // let the slow build take the lock first
        tokio::time::sleep(Duration::from_millis(100)).await;
        second.build_paths(&req, BuildMode::Normal).await
    };
    let (a, b) = tokio::join!(a, b);
    a.unwrap();
    b.unwrap();
    assert!(store.is_valid_path(&out_path).await.unwrap());
    assert_eq!(slow.calls().len(), 1);
    assert!(fast.calls().is_empty());
}

#[test_log::test(tokio::test)]
async fn builds_a_derivation_that_is_not_in_the_store() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    let (drv, out_path) = ia_drv("adhoc-1.0", '5');
    let drv_path = fixture_path('6', "adhoc-1.0.drv");

    let realiser = Realiser::new(store.clone(), builder.clone());
    let result = realiser
        .build_derivation(&drv_path, &drv, OutputSpec::All, BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::Built);
    assert!(store.is_valid_path(&out_path).await.unwrap());
    // the derivation file itself was never written to the store
    assert!(!store.is_valid_path(&drv_path).await.unwrap());
    assert_eq!(builder.calls(), vec!["adhoc-1.0"]);
}

#[test_log::test(tokio::test)]
async fn floating_builds_serialize_through_the_derivation_lock() {
    let lock_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(
        StoreConfig::default().with_lock_root(lock_dir.path()),
    ));
    let slow = ScriptedBuilder::new();
    slow.plan("floaty-1.0", Plan::Succeed {
        delay: Duration::from_millis(400),
    });
    let fast = ScriptedBuilder::new();
    let drv = floating_drv("floaty-1.0");
    let drv_path = store.add_derivation(&drv).await.unwrap();

    let settings = SchedulerSettings {
        lock_poll_interval: Duration::from_millis(50),
        ..SchedulerSettings::default()
    };
    let first = Realiser::new(store.clone(), slow.clone()).with_settings(settings.clone());
    let second = Realiser::new(store.clone(), fast.clone()).with_settings(settings);

    let req = vec![want(&drv_path)];
    let a = {
        let req = req.clone();
        async move { first.build_paths(&req, BuildMode::Normal).await }
    };
    let b = async move {
        // the output has no path yet, so the drv path is the lock key
        tokio::time::sleep(Duration::from_millis(100)).await;
        second.build_paths(&req, BuildMode::Normal).await
    };
    let (a, b) = tokio::join!(a, b);
    a.unwrap();
    b.unwrap();
    assert_eq!(slow.calls().len(), 1);
    assert!(fast.calls().is_empty());
}

#[test_log::test(tokio::test)]
async fn check_mode_needs_a_previous_build() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    let (drv, _) = ia_drv("hello-1.0", '0');
    let drv_path = store.add_derivation(&drv).await.unwrap();

    let realiser = Realiser::new(store.clone(), builder.clone());
    let result = realiser
        .build_derivation(&drv_path, &drv, OutputSpec::All, BuildMode::Check)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::MiscFailure);
    assert!(
        result
            .error_msg
            .unwrap()
            .contains("checking is not possible")
    );
    assert!(builder.calls().is_empty());

    // and the failure is not reported as a determinism mismatch
    let err = realiser
        .build_paths(&[want(&drv_path)], BuildMode::Check)
        .await
        .unwrap_err();
    match err {
        SchedulerError::BuildsFailed { exit_status, .. } => assert_eq!(exit_status, 1),
        other => panic!("expected BuildsFailed, got {other}"),
    }
}

#[test_log::test(tokio::test)]
async fn check_mode_flags_nondeterminism() {
    let store = Arc::new(MemoryStore::new(StoreConfig::default()));
    let builder = ScriptedBuilder::new();
    let (drv, _) = ia_drv("hello-1.0", '0');
    let drv_path = store.add_derivation(&drv).await.unwrap();

    let realiser = Realiser::new(store.clone(), builder.clone());
    realiser
        .build_paths(&[want(&drv_path)], BuildMode::Normal)
        .await
        .unwrap();

    // same script, same contents: deterministic
    let result = realiser
        .build_derivation(&drv_path, &drv, OutputSpec::All, BuildMode::Check)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::Built);

    builder.plan(
        "hello-1.0",
        Plan::Produce(BTreeMap::from([(
            "out".to_string(),
            Bytes::from("different this time"),
        )])),
    );
    let result = realiser
        .build_derivation(&drv_path, &drv, OutputSpec::All, BuildMode::Check)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::NotDeterministic);
    assert!(result.is_non_deterministic);
}
