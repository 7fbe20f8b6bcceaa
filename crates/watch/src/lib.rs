//! Kelpie watch layer – discovery-backed resource mapping, per-kind
//! watch-backed stores, and the store registry the cache front end drives.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use kube::core::ApiResource;
use kube::discovery::{Discovery, Scope};
use kube::Client;
use rustc_hash::FxHashMap;
use tracing::info;

use kelpie_core::ResourceKind;

mod set;
mod store;

pub use set::{ByKindConfig, StoreSet, StoreSetOptions};
pub use store::{HandlerRegistration, IndexFn, KindStore, StoreEventHandler};

/// How to reach one kind on the wire: its API resource plus scope.
#[derive(Debug, Clone)]
pub struct MappedResource {
    pub api_resource: ApiResource,
    pub namespaced: bool,
}

impl MappedResource {
    pub fn namespaced(api_resource: ApiResource) -> Self {
        Self { api_resource, namespaced: true }
    }

    pub fn cluster(api_resource: ApiResource) -> Self {
        Self { api_resource, namespaced: false }
    }
}

/// Kind to API-resource mapping, normally built once from server discovery.
#[derive(Debug, Clone, Default)]
pub struct ResourceMapper {
    entries: FxHashMap<ResourceKind, MappedResource>,
}

impl ResourceMapper {
    /// Walk server discovery and record every served resource (incl. CRDs).
    pub async fn discover(client: &Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .context("running API discovery")?;
        let mut entries = FxHashMap::default();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let kind = ResourceKind::gvk(ar.group.clone(), ar.version.clone(), ar.kind.clone());
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                entries.insert(kind, MappedResource { api_resource: ar.clone(), namespaced });
            }
        }
        info!(resources = entries.len(), "discovery mapped served resources");
        Ok(Self { entries })
    }

    pub fn insert(&mut self, kind: ResourceKind, mapped: MappedResource) {
        self.entries.insert(kind, mapped);
    }

    pub fn resolve(&self, kind: &ResourceKind) -> Result<&MappedResource> {
        self.entries
            .get(kind)
            .ok_or_else(|| anyhow!("no API resource mapped for kind {kind}"))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
