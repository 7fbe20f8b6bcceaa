//! Kelpie schema registry – resolving live object identities to resource
//! kinds and back.

#![forbid(unsafe_code)]

use std::any::{Any, TypeId};
use std::sync::Arc;

use kelpie_core::ResourceKind;
use kube::Resource;
use rustc_hash::FxHashMap;

/// A live, type-carrying resource value. The concrete type, not the field
/// contents, is what identifies the kind.
///
/// Blanket-implemented for every statically typed Kubernetes resource, so
/// any k8s-openapi kind can be used as an identity directly.
pub trait ObjectIdentity: Send + Sync {
    fn resource_kind(&self) -> ResourceKind;
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
}

impl std::fmt::Debug for dyn ObjectIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectIdentity")
            .field("type_name", &self.type_name())
            .field("resource_kind", &self.resource_kind())
            .finish()
    }
}

impl<K> ObjectIdentity for K
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::gvk(K::group(&()).to_string(), K::version(&()).to_string(), K::kind(&()).to_string())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<K>()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("kind resolution: {0}")]
    KindResolution(String),
    #[error("capability: {0}")]
    Capability(String),
}

type IdentityFactory = Arc<dyn Fn() -> Box<dyn ObjectIdentity> + Send + Sync>;

#[derive(Clone)]
struct KindEntry {
    type_name: Option<&'static str>,
    factory: Option<IdentityFactory>,
}

/// Two-way mapping between concrete identity types and resource kinds.
///
/// Kinds registered through [`SchemaRegistry::register`] can materialize a
/// representative identity; kinds registered dynamically (for example from
/// discovery) are known but carry no concrete Rust type.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    by_type: FxHashMap<TypeId, ResourceKind>,
    by_kind: FxHashMap<ResourceKind, KindEntry>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a statically typed kind.
    pub fn register<K>(&mut self)
    where
        K: Resource<DynamicType = ()> + Default + Send + Sync + 'static,
    {
        let kind = ResourceKind::gvk(
            K::group(&()).to_string(),
            K::version(&()).to_string(),
            K::kind(&()).to_string(),
        );
        let factory: IdentityFactory = Arc::new(|| Box::new(K::default()) as Box<dyn ObjectIdentity>);
        self.by_type.insert(TypeId::of::<K>(), kind.clone());
        self.by_kind.insert(
            kind,
            KindEntry { type_name: Some(std::any::type_name::<K>()), factory: Some(factory) },
        );
    }

    /// Chainable form of [`SchemaRegistry::register`].
    pub fn with<K>(mut self) -> Self
    where
        K: Resource<DynamicType = ()> + Default + Send + Sync + 'static,
    {
        self.register::<K>();
        self
    }

    /// Register a kind with no concrete Rust type behind it, e.g. one taken
    /// from discovery. Such kinds resolve forward but cannot materialize an
    /// identity.
    pub fn register_kind(&mut self, kind: ResourceKind) {
        self.by_kind.entry(kind).or_insert(KindEntry { type_name: None, factory: None });
    }

    /// Resolve an identity's concrete type to its kind.
    pub fn kind_for(&self, identity: &dyn ObjectIdentity) -> Result<ResourceKind, SchemaError> {
        self.by_type.get(&identity.as_any().type_id()).cloned().ok_or_else(|| {
            SchemaError::KindResolution(format!("no kind registered for type {}", identity.type_name()))
        })
    }

    /// Materialize a representative identity for a kind.
    pub fn identity_for(&self, kind: &ResourceKind) -> Result<Box<dyn ObjectIdentity>, SchemaError> {
        let entry = self
            .by_kind
            .get(kind)
            .ok_or_else(|| SchemaError::KindResolution(format!("no type registered for kind {kind}")))?;
        match &entry.factory {
            Some(f) => Ok(f()),
            None => Err(SchemaError::Capability(format!(
                "kind {kind} is registered without a concrete identity type"
            ))),
        }
    }

    pub fn has_kind(&self, kind: &ResourceKind) -> bool {
        self.by_kind.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &ResourceKind> {
        self.by_kind.keys()
    }

    pub fn len(&self) -> usize {
        self.by_kind.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }

    /// Union of both inputs, skipping a missing one; entries from the second
    /// (override) input win on conflict. Both missing yields missing.
    pub fn union(inherited: Option<&SchemaRegistry>, overrides: Option<&SchemaRegistry>) -> Option<SchemaRegistry> {
        let mut out: Option<SchemaRegistry> = None;
        for reg in [inherited, overrides].into_iter().flatten() {
            let merged = out.get_or_insert_with(SchemaRegistry::default);
            for (type_id, kind) in &reg.by_type {
                merged.by_type.insert(*type_id, kind.clone());
            }
            for (kind, entry) in &reg.by_kind {
                merged.by_kind.insert(kind.clone(), entry.clone());
            }
        }
        out
    }

    /// The built-in kinds every cache knows about unless told otherwise.
    pub fn core_kinds() -> Self {
        use k8s_openapi::api::apps::v1 as apps;
        use k8s_openapi::api::batch::v1 as batch;
        use k8s_openapi::api::core::v1 as corev1;

        Self::default()
            .with::<corev1::Pod>()
            .with::<corev1::Service>()
            .with::<corev1::ConfigMap>()
            .with::<corev1::Secret>()
            .with::<corev1::Namespace>()
            .with::<corev1::Node>()
            .with::<corev1::ServiceAccount>()
            .with::<corev1::Endpoints>()
            .with::<corev1::PersistentVolume>()
            .with::<corev1::PersistentVolumeClaim>()
            .with::<apps::Deployment>()
            .with::<apps::ReplicaSet>()
            .with::<apps::StatefulSet>()
            .with::<apps::DaemonSet>()
            .with::<batch::Job>()
            .with::<batch::CronJob>()
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry").field("kinds", &self.by_kind.len()).finish()
    }
}
