//! Multi-namespace fan-out: one store set per namespace, with aggregated
//! reads and sync reporting.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use kelpie_core::{ObjectKey, ResourceKind, NAMESPACE_ALL};
use kelpie_watch::{ByKindConfig, ResourceMapper, StoreSet, StoreSetOptions};

use crate::{list_matches, CacheError, CacheResult, ListOptions, StoreHandle};

pub(crate) struct MultiNamespaceCache {
    sets: Vec<(String, StoreSet)>,
}

impl MultiNamespaceCache {
    pub(crate) fn new(
        client: Client,
        mapper: ResourceMapper,
        resync_every: Duration,
        namespaces: &[String],
        by_kind: ByKindConfig,
    ) -> Self {
        let sets = namespaces
            .iter()
            .map(|ns| {
                let namespace = if ns == NAMESPACE_ALL { None } else { Some(ns.clone()) };
                let set = StoreSet::new(StoreSetOptions {
                    client: client.clone(),
                    mapper: mapper.clone(),
                    namespace,
                    resync_every,
                    by_kind: by_kind.clone(),
                });
                (ns.clone(), set)
            })
            .collect();
        Self { sets }
    }

    fn set_for(&self, namespace: &str) -> CacheResult<&StoreSet> {
        self.sets
            .iter()
            .find(|(ns, _)| ns == namespace)
            .map(|(_, set)| set)
            .ok_or_else(|| CacheError::Internal(format!("namespace {namespace} is not watched by this cache")))
    }

    pub(crate) fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> CacheResult<Option<Arc<Value>>> {
        match &key.namespace {
            Some(ns) => Ok(self.set_for(ns)?.get_or_create(kind)?.get(key)),
            // Cluster-scoped keys are visible through every member; first hit
            // wins.
            None => {
                for (_, set) in &self.sets {
                    if let Some(obj) = set.get_or_create(kind)?.get(key) {
                        return Ok(Some(obj));
                    }
                }
                Ok(None)
            }
        }
    }

    pub(crate) fn list(&self, kind: &ResourceKind, opts: &ListOptions) -> CacheResult<Vec<Arc<Value>>> {
        match &opts.namespace {
            Some(ns) => {
                let store = self.set_for(ns)?.get_or_create(kind)?;
                Ok(store.list().into_iter().filter(|o| list_matches(o, opts)).collect())
            }
            None => {
                let mut out = Vec::new();
                for (_, set) in &self.sets {
                    let store = set.get_or_create(kind)?;
                    out.extend(store.list().into_iter().filter(|o| list_matches(o, opts)));
                }
                Ok(out)
            }
        }
    }

    pub(crate) fn store_for_kind(&self, kind: &ResourceKind) -> CacheResult<StoreHandle> {
        let mut stores = Vec::with_capacity(self.sets.len());
        for (ns, set) in &self.sets {
            stores.push((ns.clone(), set.get_or_create(kind)?));
        }
        Ok(StoreHandle::per_namespace(stores))
    }

    pub(crate) async fn start(&self, shutdown: CancellationToken) -> CacheResult<()> {
        for (ns, set) in &self.sets {
            let set = set.clone();
            let token = shutdown.clone();
            let ns = ns.clone();
            tokio::spawn(async move {
                if let Err(e) = set.start(token).await {
                    warn!(ns = %ns, error = %e, "namespace store set failed to start");
                }
            });
        }
        shutdown.cancelled().await;
        Ok(())
    }

    pub(crate) async fn wait_for_sync(&self, shutdown: &CancellationToken) -> bool {
        for (_, set) in &self.sets {
            if !set.wait_for_sync(shutdown).await {
                return false;
            }
        }
        true
    }
}
