//! Kelpie cache – a client-side watch cache for Kubernetes objects.
//!
//! Reads are served from per-kind in-memory stores kept current by long-lived
//! watch streams. A cache is built from [`Options`] describing its view
//! (namespaces, selectors, transforms, deep-copy policy); two option layers
//! can be composed with [`Options::inherit_from`] or via [`CacheBuilder`].

#![forbid(unsafe_code)]

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kelpie_watch::{StoreSet, StoreSetOptions};

mod multi;
mod options;

pub use kelpie_core::{
    FieldSelector, KindKey, LabelSelector, ObjectKey, ResourceKind, Selector, Transform, NAMESPACE_ALL,
};
pub use kelpie_schema::{ObjectIdentity, SchemaError, SchemaRegistry};
pub use kelpie_watch::{HandlerRegistration, IndexFn, KindStore, MappedResource, ResourceMapper, StoreEventHandler};
pub use options::{
    DisableDeepCopyByObject, IdentityKey, Options, SelectorsByObject, TransformsByObject, ViewByObject,
    ViewOptions, DEFAULT_RESYNC_EVERY,
};

use multi::MultiNamespaceCache;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("transport: {0}")]
    Transport(#[source] kube::Error),
    #[error("discovery: {0}")]
    Discovery(#[source] anyhow::Error),
    #[error("composition: {0}")]
    Composition(#[source] SchemaError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("store: {0}")]
    Store(#[from] anyhow::Error),
    #[error("internal: {0}")]
    Internal(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Criteria for [`Cache::list`], evaluated locally against stored objects.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub namespace: Option<String>,
    pub labels: Option<LabelSelector>,
    pub fields: Option<FieldSelector>,
}

/// Build a ready-but-unstarted cache; follow with [`Cache::start`].
pub async fn new(config: kube::Config, opts: Options) -> CacheResult<Cache> {
    let opts = opts.apply_defaults(&config).await?;
    Cache::from_defaulted(opts)
}

/// The BuilderWithOptions contract: a constructor carrying preset options
/// that composes them over an inherited layer before building.
pub struct CacheBuilder {
    options: Options,
}

impl CacheBuilder {
    pub fn with_options(options: Options) -> Self {
        Self { options }
    }

    pub async fn build(self, config: kube::Config, inherited: Options) -> CacheResult<Cache> {
        let inherited = inherited.apply_defaults(&config).await?;
        let options = self.options.apply_defaults(&config).await?;
        let combined = options.inherit_from(inherited)?;
        new(config, combined).await
    }
}

/// Convenience alias for [`CacheBuilder::with_options`].
pub fn builder_with_options(options: Options) -> CacheBuilder {
    CacheBuilder::with_options(options)
}

enum CacheInner {
    Single(StoreSet),
    Multi(MultiNamespaceCache),
}

/// A running (or about-to-run) object cache. Reads hit the per-kind stores;
/// the informer surface exposes the stores themselves.
pub struct Cache {
    registry: SchemaRegistry,
    namespaces: Vec<String>,
    inner: CacheInner,
}

impl Cache {
    fn from_defaulted(opts: Options) -> CacheResult<Cache> {
        let (Some(client), Some(registry), Some(mapper), Some(resync_every)) = (
            opts.client.clone(),
            opts.registry.clone(),
            opts.mapper.clone(),
            opts.resync_every,
        ) else {
            return Err(CacheError::Internal("cache options missing defaults".into()));
        };

        let by_kind = opts.view_by_kind(&registry)?;

        let mut namespaces = opts.view.namespaces.clone();
        if namespaces.is_empty() {
            namespaces.push(NAMESPACE_ALL.to_string());
        }

        let inner = if namespaces.len() > 1 {
            info!(namespaces = namespaces.len(), "building multi-namespace cache");
            CacheInner::Multi(MultiNamespaceCache::new(client, mapper, resync_every, &namespaces, by_kind))
        } else {
            let ns = namespaces[0].clone();
            let namespace = if ns == NAMESPACE_ALL { None } else { Some(ns) };
            info!(ns = ?namespace, "building cache");
            CacheInner::Single(StoreSet::new(StoreSetOptions {
                client,
                mapper,
                namespace,
                resync_every,
                by_kind,
            }))
        };

        Ok(Cache { registry, namespaces, inner })
    }

    /// The resolved namespace list this cache watches.
    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    // ---- reads ----

    /// Fetch one object by key. The store for the kind is created on first
    /// use; callers normally [`Cache::wait_for_sync`] first.
    pub fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> CacheResult<Option<Arc<Value>>> {
        match &self.inner {
            CacheInner::Single(set) => Ok(set.get_or_create(kind)?.get(key)),
            CacheInner::Multi(m) => m.get(kind, key),
        }
    }

    /// Typed front door for [`Cache::get`].
    pub fn get_for<K>(&self, key: &ObjectKey) -> CacheResult<Option<Arc<Value>>>
    where
        K: ObjectIdentity + Default + 'static,
    {
        let kind = self.registry.kind_for(&K::default())?;
        self.get(&kind, key)
    }

    /// List objects of a kind matching the criteria.
    pub fn list(&self, kind: &ResourceKind, opts: &ListOptions) -> CacheResult<Vec<Arc<Value>>> {
        match &self.inner {
            CacheInner::Single(set) => {
                let store = set.get_or_create(kind)?;
                Ok(store.list().into_iter().filter(|o| list_matches(o, opts)).collect())
            }
            CacheInner::Multi(m) => m.list(kind, opts),
        }
    }

    // ---- informers ----

    /// Fetch or create the store(s) backing a kind.
    pub fn store_for_kind(&self, kind: &ResourceKind) -> CacheResult<StoreHandle> {
        match &self.inner {
            CacheInner::Single(set) => Ok(StoreHandle::single(set.get_or_create(kind)?)),
            CacheInner::Multi(m) => m.store_for_kind(kind),
        }
    }

    /// Typed front door for [`Cache::store_for_kind`].
    pub fn store_for<K>(&self) -> CacheResult<StoreHandle>
    where
        K: ObjectIdentity + Default + 'static,
    {
        let kind = self.registry.kind_for(&K::default())?;
        self.store_for_kind(&kind)
    }

    /// Run every store until the token fires. Blocks.
    pub async fn start(&self, shutdown: CancellationToken) -> CacheResult<()> {
        match &self.inner {
            CacheInner::Single(set) => Ok(set.start(shutdown).await?),
            CacheInner::Multi(m) => m.start(shutdown).await,
        }
    }

    /// Wait until every known store has applied its initial list. False if
    /// the token fires first; "not synced yet" is not an error.
    pub async fn wait_for_sync(&self, shutdown: &CancellationToken) -> bool {
        match &self.inner {
            CacheInner::Single(set) => set.wait_for_sync(shutdown).await,
            CacheInner::Multi(m) => m.wait_for_sync(shutdown).await,
        }
    }

    /// Add a field index to a kind's store(s). Must happen before first sync.
    pub fn index_field(&self, kind: &ResourceKind, name: &str, extract: IndexFn) -> CacheResult<()> {
        self.store_for_kind(kind)?.add_index(name, extract)
    }

    /// Typed front door for [`Cache::index_field`].
    pub fn index_field_for<K>(&self, name: &str, extract: IndexFn) -> CacheResult<()>
    where
        K: ObjectIdentity + Default + 'static,
    {
        let kind = self.registry.kind_for(&K::default())?;
        self.index_field(&kind, name, extract)
    }
}

pub(crate) fn list_matches(obj: &Value, opts: &ListOptions) -> bool {
    if let Some(ns) = &opts.namespace {
        let held = obj.pointer("/metadata/namespace").and_then(|v| v.as_str()).unwrap_or("");
        if held != ns {
            return false;
        }
    }
    if let Some(labels) = &opts.labels {
        if !labels.matches(&kelpie_core::labels_of(obj)) {
            return false;
        }
    }
    if let Some(fields) = &opts.fields {
        if !fields.matches(obj) {
            return false;
        }
    }
    true
}

/// The store(s) backing one kind: a single store, or one per namespace when
/// the cache spans several. Event handlers and indices fan out; sync state
/// aggregates.
#[derive(Clone)]
pub struct StoreHandle {
    stores: Vec<(Option<String>, KindStore)>,
}

impl StoreHandle {
    pub(crate) fn single(store: KindStore) -> Self {
        Self { stores: vec![(None, store)] }
    }

    pub(crate) fn per_namespace(stores: Vec<(String, KindStore)>) -> Self {
        Self { stores: stores.into_iter().map(|(ns, s)| (Some(ns), s)).collect() }
    }

    /// True once every backing store has applied its initial list.
    pub fn has_synced(&self) -> bool {
        self.stores.iter().all(|(_, s)| s.has_synced())
    }

    pub fn add_event_handler(&self, handler: Arc<dyn StoreEventHandler>) -> StoreHandleRegistration {
        let regs = self
            .stores
            .iter()
            .map(|(_, s)| (s.clone(), s.add_event_handler(Arc::clone(&handler))))
            .collect();
        StoreHandleRegistration { regs }
    }

    /// Idempotent, like the per-store removal it fans out to.
    pub fn remove_event_handler(&self, reg: StoreHandleRegistration) {
        for (store, r) in reg.regs {
            store.remove_event_handler(r);
        }
    }

    pub fn add_index(&self, name: &str, extract: IndexFn) -> CacheResult<()> {
        for (_, store) in &self.stores {
            store.add_index(name, Arc::clone(&extract))?;
        }
        Ok(())
    }

    pub fn stores(&self) -> impl Iterator<Item = &KindStore> {
        self.stores.iter().map(|(_, s)| s)
    }
}

/// Aggregate registration handle from [`StoreHandle::add_event_handler`].
pub struct StoreHandleRegistration {
    regs: Vec<(KindStore, HandlerRegistration)>,
}
