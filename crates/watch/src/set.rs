//! The per-kind store registry: lazily creates stores, runs their watch
//! loops, and reports aggregate sync state.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, Result};
use kube::Client;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use kelpie_core::{KindKey, ResourceKind, Selector, Transform};

use crate::store::{IndexFn, KindStore};
use crate::ResourceMapper;

/// Per-kind cache configuration in canonical kind-keyed form. Each map holds
/// an entry under [`KindKey::All`] for the default.
#[derive(Clone, Default)]
pub struct ByKindConfig {
    pub selectors: FxHashMap<KindKey, Selector>,
    pub transforms: FxHashMap<KindKey, Transform>,
    pub disable_deep_copy: FxHashMap<KindKey, bool>,
}

impl ByKindConfig {
    fn selector_for(&self, kind: &ResourceKind) -> Selector {
        self.lookup(&self.selectors, kind).cloned().unwrap_or_default()
    }

    fn transform_for(&self, kind: &ResourceKind) -> Transform {
        self.lookup(&self.transforms, kind).cloned().unwrap_or_default()
    }

    fn disable_deep_copy_for(&self, kind: &ResourceKind) -> bool {
        self.lookup(&self.disable_deep_copy, kind).copied().unwrap_or(false)
    }

    fn lookup<'a, T>(&self, map: &'a FxHashMap<KindKey, T>, kind: &ResourceKind) -> Option<&'a T> {
        map.get(&KindKey::Kind(kind.clone())).or_else(|| map.get(&KindKey::All))
    }
}

pub struct StoreSetOptions {
    pub client: Client,
    pub mapper: ResourceMapper,
    pub namespace: Option<String>,
    pub resync_every: Duration,
    pub by_kind: ByKindConfig,
}

struct SetInner {
    client: Client,
    mapper: ResourceMapper,
    namespace: Option<String>,
    resync_every: Duration,
    by_kind: ByKindConfig,
    stores: RwLock<FxHashMap<ResourceKind, KindStore>>,
    // Lock order: `run` before `stores`. Spawn decisions happen under `run`
    // so a store joins the running set exactly once.
    run: Mutex<Option<CancellationToken>>,
}

/// Registry of per-kind stores for one namespace scope. Cheap to clone; all
/// clones share state.
#[derive(Clone)]
pub struct StoreSet {
    inner: Arc<SetInner>,
}

impl StoreSet {
    pub fn new(opts: StoreSetOptions) -> Self {
        Self {
            inner: Arc::new(SetInner {
                client: opts.client,
                mapper: opts.mapper,
                namespace: opts.namespace,
                resync_every: opts.resync_every,
                by_kind: opts.by_kind,
                stores: RwLock::new(FxHashMap::default()),
                run: Mutex::new(None),
            }),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.inner.namespace.as_deref()
    }

    /// Fetch or construct the store for a kind. Idempotent: concurrent
    /// callers observe at most one store constructed per kind and share the
    /// result. Stores requested after [`StoreSet::start`] join the running
    /// set immediately.
    pub fn get_or_create(&self, kind: &ResourceKind) -> Result<KindStore> {
        if let Some(store) = self.inner.stores.read().unwrap().get(kind) {
            return Ok(store.clone());
        }
        let run = self.inner.run.lock().unwrap();
        let mut stores = self.inner.stores.write().unwrap();
        if let Some(store) = stores.get(kind) {
            return Ok(store.clone());
        }
        let mapped = self.inner.mapper.resolve(kind)?.clone();
        let store = KindStore::new(
            kind.clone(),
            mapped,
            self.inner.namespace.clone(),
            self.inner.by_kind.selector_for(kind),
            self.inner.by_kind.transform_for(kind),
            self.inner.by_kind.disable_deep_copy_for(kind),
            self.inner.resync_every,
        );
        stores.insert(kind.clone(), store.clone());
        debug!(gvk = %kind, ns = ?self.inner.namespace, "store created");
        if let Some(token) = run.as_ref() {
            self.spawn_store(store.clone(), token.clone());
        }
        Ok(store)
    }

    fn spawn_store(&self, store: KindStore, token: CancellationToken) {
        let client = self.inner.client.clone();
        tokio::spawn(async move { store.run(client, token).await });
    }

    /// Run all known stores until the token fires. Blocks; calling it twice
    /// is an error.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        {
            let mut run = self.inner.run.lock().unwrap();
            if run.is_some() {
                bail!("store set already started");
            }
            *run = Some(shutdown.clone());
            let stores = self.inner.stores.read().unwrap();
            info!(stores = stores.len(), ns = ?self.inner.namespace, "store set starting");
            for store in stores.values() {
                self.spawn_store(store.clone(), shutdown.clone());
            }
        }
        shutdown.cancelled().await;
        Ok(())
    }

    /// Wait until every store known at call time (plus any added before this
    /// returns) has seen its initial list. Returns false if the token fires
    /// first.
    pub async fn wait_for_sync(&self, shutdown: &CancellationToken) -> bool {
        loop {
            let pending: Vec<KindStore> = {
                let stores = self.inner.stores.read().unwrap();
                stores.values().filter(|s| !s.has_synced()).cloned().collect()
            };
            if pending.is_empty() {
                return true;
            }
            for store in pending {
                let mut synced = store.synced_stream();
                tokio::select! {
                    _ = shutdown.cancelled() => return false,
                    res = synced.wait_for(|s| *s) => {
                        if res.is_err() {
                            return false;
                        }
                    }
                }
            }
            // Re-check: stores may have been added while we waited.
        }
    }

    /// Add a field index to a kind's store, creating the store if needed.
    pub fn add_index(&self, kind: &ResourceKind, name: impl Into<String>, extract: IndexFn) -> Result<()> {
        self.get_or_create(kind)?.add_index(name, extract)
    }

    /// Stores currently known to the set.
    pub fn stores(&self) -> Vec<KindStore> {
        self.inner.stores.read().unwrap().values().cloned().collect()
    }
}
