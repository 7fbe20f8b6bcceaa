//! Per-kind watch-backed store: one long-lived list+watch stream feeding an
//! in-memory map, with event handlers and field indices on top.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::TryStreamExt;
use kube::api::Api;
use kube::core::DynamicObject;
use kube::runtime::watcher::{self, Event};
use kube::Client;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use anyhow::{anyhow, bail, Context, Result};
use kelpie_core::{ObjectKey, ResourceKind, Selector, Transform};

use crate::MappedResource;

/// Observer of one store's apply/delete events. Events are delivered at most
/// once per registered handler; there is no ordering across handlers.
pub trait StoreEventHandler: Send + Sync {
    fn on_applied(&self, obj: &Arc<Value>);
    fn on_deleted(&self, obj: &Arc<Value>);
}

/// Handle returned by [`KindStore::add_event_handler`]; used to remove the
/// handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerRegistration(u64);

/// Extracts index keys from a stored object.
pub type IndexFn = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

struct FieldIndex {
    extract: IndexFn,
    postings: FxHashMap<String, HashSet<ObjectKey>>,
}

impl FieldIndex {
    fn add(&mut self, key: &ObjectKey, obj: &Value) {
        for v in (self.extract)(obj) {
            self.postings.entry(v).or_default().insert(key.clone());
        }
    }

    fn remove(&mut self, key: &ObjectKey, obj: &Value) {
        for v in (self.extract)(obj) {
            if let Some(set) = self.postings.get_mut(&v) {
                set.remove(key);
                if set.is_empty() {
                    self.postings.remove(&v);
                }
            }
        }
    }
}

struct StoreInner {
    kind: ResourceKind,
    mapped: MappedResource,
    namespace: Option<String>,
    selector: Selector,
    transform: Transform,
    disable_deep_copy: bool,
    resync_every: Duration,
    objects: RwLock<FxHashMap<ObjectKey, Arc<Value>>>,
    indices: RwLock<FxHashMap<String, FieldIndex>>,
    handlers: RwLock<Vec<(u64, Arc<dyn StoreEventHandler>)>>,
    next_handler: AtomicU64,
    synced: watch::Sender<bool>,
}

/// One kind's local store. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct KindStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for KindStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindStore")
            .field("kind", &self.inner.kind)
            .field("namespace", &self.inner.namespace)
            .finish_non_exhaustive()
    }
}

impl KindStore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kind: ResourceKind,
        mapped: MappedResource,
        namespace: Option<String>,
        selector: Selector,
        transform: Transform,
        disable_deep_copy: bool,
        resync_every: Duration,
    ) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            inner: Arc::new(StoreInner {
                kind,
                mapped,
                namespace,
                selector,
                transform,
                disable_deep_copy,
                resync_every,
                objects: RwLock::new(FxHashMap::default()),
                indices: RwLock::new(FxHashMap::default()),
                handlers: RwLock::new(Vec::new()),
                next_handler: AtomicU64::new(0),
                synced,
            }),
        }
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.inner.kind
    }

    /// True once the initial list has been applied.
    pub fn has_synced(&self) -> bool {
        *self.inner.synced.borrow()
    }

    pub(crate) fn synced_stream(&self) -> watch::Receiver<bool> {
        self.inner.synced.subscribe()
    }

    /// Marks the initial list as applied. Part of the ingest path driven by
    /// the watch loop.
    pub fn mark_synced(&self) {
        let _ = self.inner.synced.send(true);
    }

    pub fn len(&self) -> usize {
        self.inner.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.objects.read().unwrap().is_empty()
    }

    /// Read one object. Returns a defensive copy unless deep copies are
    /// disabled for this kind, in which case the stored value is shared.
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<Value>> {
        let objects = self.inner.objects.read().unwrap();
        objects.get(key).map(|v| self.read_copy(v))
    }

    /// Read every stored object, same copy rule as [`KindStore::get`].
    pub fn list(&self) -> Vec<Arc<Value>> {
        let objects = self.inner.objects.read().unwrap();
        objects.values().map(|v| self.read_copy(v)).collect()
    }

    fn read_copy(&self, v: &Arc<Value>) -> Arc<Value> {
        if self.inner.disable_deep_copy {
            Arc::clone(v)
        } else {
            Arc::new((**v).clone())
        }
    }

    pub fn add_event_handler(&self, handler: Arc<dyn StoreEventHandler>) -> HandlerRegistration {
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().unwrap().push((id, handler));
        HandlerRegistration(id)
    }

    /// Idempotent: removing an already-removed handler is a no-op.
    pub fn remove_event_handler(&self, reg: HandlerRegistration) {
        self.inner.handlers.write().unwrap().retain(|(id, _)| *id != reg.0);
    }

    fn handlers_snapshot(&self) -> Vec<Arc<dyn StoreEventHandler>> {
        self.inner.handlers.read().unwrap().iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    /// Add a field index. Must happen before the store holds data.
    pub fn add_index(&self, name: impl Into<String>, extract: IndexFn) -> Result<()> {
        let name = name.into();
        if !self.is_empty() {
            bail!("store for {} already has data; indices must be added before sync", self.inner.kind);
        }
        let mut indices = self.inner.indices.write().unwrap();
        if indices.contains_key(&name) {
            bail!("index {:?} already exists on store for {}", name, self.inner.kind);
        }
        indices.insert(name, FieldIndex { extract, postings: FxHashMap::default() });
        Ok(())
    }

    /// Objects whose index emitted the given value.
    pub fn by_index(&self, name: &str, value: &str) -> Result<Vec<Arc<Value>>> {
        let indices = self.inner.indices.read().unwrap();
        let index = indices
            .get(name)
            .ok_or_else(|| anyhow!("no index {:?} on store for {}", name, self.inner.kind))?;
        let keys: Vec<ObjectKey> = match index.postings.get(value) {
            Some(set) => set.iter().cloned().collect(),
            None => return Ok(Vec::new()),
        };
        drop(indices);
        let objects = self.inner.objects.read().unwrap();
        Ok(keys.iter().filter_map(|k| objects.get(k).map(|v| self.read_copy(v))).collect())
    }

    // ---- ingest path (driven by the watch loop; also the test surface) ----

    /// Transform and store one applied object. Broken objects are logged and
    /// skipped rather than poisoning the stream.
    pub fn apply(&self, raw: Value) {
        if let Some((key, stored)) = self.transform_and_key(raw) {
            self.store_applied(key, stored);
        }
    }

    /// Drop one object by the key in its metadata.
    pub fn delete(&self, raw: &Value) {
        if let Some(key) = ObjectKey::from_raw(raw) {
            self.remove_key(&key);
        }
    }

    /// Replace the whole contents with a fresh list, then mark synced.
    pub fn replace(&self, list: Vec<Value>) {
        let mut incoming = Vec::with_capacity(list.len());
        for raw in list {
            if let Some(pair) = self.transform_and_key(raw) {
                incoming.push(pair);
            }
        }
        let keep: HashSet<ObjectKey> = incoming.iter().map(|(k, _)| k.clone()).collect();
        let stale: Vec<ObjectKey> = {
            let objects = self.inner.objects.read().unwrap();
            objects.keys().filter(|k| !keep.contains(k)).cloned().collect()
        };
        for key in stale {
            self.remove_key(&key);
        }
        for (key, stored) in incoming {
            self.store_applied(key, stored);
        }
        self.mark_synced();
    }

    fn transform_and_key(&self, raw: Value) -> Option<(ObjectKey, Arc<Value>)> {
        let raw = match self.inner.transform.apply(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(gvk = %self.inner.kind, error = %e, "transform failed; object skipped");
                counter!("kelpie_store_transform_failures_total", 1);
                return None;
            }
        };
        match ObjectKey::from_raw(&raw) {
            Some(key) => Some((key, Arc::new(raw))),
            None => {
                warn!(gvk = %self.inner.kind, "object without metadata.name skipped");
                None
            }
        }
    }

    fn store_applied(&self, key: ObjectKey, stored: Arc<Value>) {
        let prev = {
            let mut objects = self.inner.objects.write().unwrap();
            objects.insert(key.clone(), Arc::clone(&stored))
        };
        {
            let mut indices = self.inner.indices.write().unwrap();
            for index in indices.values_mut() {
                if let Some(prev) = &prev {
                    index.remove(&key, prev);
                }
                index.add(&key, &stored);
            }
        }
        counter!("kelpie_store_applied_total", 1);
        for h in self.handlers_snapshot() {
            h.on_applied(&stored);
        }
    }

    fn remove_key(&self, key: &ObjectKey) {
        let removed = { self.inner.objects.write().unwrap().remove(key) };
        let Some(removed) = removed else { return };
        {
            let mut indices = self.inner.indices.write().unwrap();
            for index in indices.values_mut() {
                index.remove(key, &removed);
            }
        }
        counter!("kelpie_store_deleted_total", 1);
        for h in self.handlers_snapshot() {
            h.on_deleted(&removed);
        }
    }

    /// Re-deliver the current contents to every registered handler.
    fn resync_handlers(&self) {
        let handlers = self.handlers_snapshot();
        if handlers.is_empty() {
            return;
        }
        let objects: Vec<Arc<Value>> = {
            let objects = self.inner.objects.read().unwrap();
            objects.values().cloned().collect()
        };
        debug!(gvk = %self.inner.kind, count = objects.len(), "store resync");
        for h in &handlers {
            for o in &objects {
                h.on_applied(o);
            }
        }
    }

    fn watcher_config(&self) -> watcher::Config {
        let mut cfg = watcher::Config::default();
        if let Some(labels) = &self.inner.selector.labels {
            if !labels.is_empty() {
                cfg = cfg.labels(&labels.to_string());
            }
        }
        if let Some(fields) = &self.inner.selector.fields {
            if !fields.terms().is_empty() {
                cfg = cfg.fields(&fields.to_string());
            }
        }
        cfg
    }

    /// Pump the list+watch stream into the store until cancelled.
    pub(crate) async fn run(&self, client: Client, shutdown: CancellationToken) {
        let ar = &self.inner.mapped.api_resource;
        let api: Api<DynamicObject> = if self.inner.mapped.namespaced {
            match &self.inner.namespace {
                Some(ns) => Api::namespaced_with(client.clone(), ns, ar),
                None => Api::all_with(client.clone(), ar),
            }
        } else {
            Api::all_with(client.clone(), ar)
        };

        let stream = watcher::watcher(api, self.watcher_config());
        futures::pin_mut!(stream);
        let mut resync = interval_at(Instant::now() + self.inner.resync_every, self.inner.resync_every);
        info!(gvk = %self.inner.kind, ns = ?self.inner.namespace, "store watcher started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(gvk = %self.inner.kind, "store watcher stopped");
                    return;
                }
                _ = resync.tick() => self.resync_handlers(),
                ev = stream.try_next() => match ev {
                    Ok(Some(Event::Applied(o))) => match serde_json::to_value(&o).context("serializing object") {
                        Ok(raw) => self.apply(raw),
                        Err(e) => warn!(gvk = %self.inner.kind, error = %e, "bad applied object skipped"),
                    },
                    Ok(Some(Event::Deleted(o))) => match serde_json::to_value(&o).context("serializing object") {
                        Ok(raw) => self.delete(&raw),
                        Err(e) => warn!(gvk = %self.inner.kind, error = %e, "bad deleted object skipped"),
                    },
                    Ok(Some(Event::Restarted(list))) => {
                        debug!(gvk = %self.inner.kind, count = list.len(), "watch restart");
                        let mut raws = Vec::with_capacity(list.len());
                        for o in &list {
                            match serde_json::to_value(o) {
                                Ok(raw) => raws.push(raw),
                                Err(e) => warn!(gvk = %self.inner.kind, error = %e, "bad listed object skipped"),
                            }
                        }
                        self.replace(raws);
                    }
                    Ok(None) => {
                        warn!(gvk = %self.inner.kind, "watch stream ended");
                        return;
                    }
                    // The watcher retries internally with backoff; a failed
                    // round surfaces here as an item, not the end.
                    Err(e) => {
                        warn!(gvk = %self.inner.kind, error = %e, "watch round failed");
                        counter!("kelpie_store_watch_errors_total", 1);
                    }
                },
            }
        }
    }
}
