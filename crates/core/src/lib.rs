//! Kelpie core types – kind keys, object keys, selectors, transforms

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub mod selector;
pub mod transform;

pub use selector::{FieldSelector, LabelSelector, Selector};
pub use transform::Transform;

/// The "watch every namespace" value, as the API server spells it.
pub const NAMESPACE_ALL: &str = "";

/// Group/version/kind triple identifying a resource schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn gvk(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// A kind in the core ("") API group, e.g. `v1/Pod`.
    pub fn core(version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::gvk("", version, kind)
    }

    /// Parse a `v1/Kind` or `group/v1/Kind` key.
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => {
                Ok(Self::core(*version, *kind))
            }
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::gvk(*group, *version, *kind))
            }
            _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Canonical key for per-kind configuration maps.
///
/// `All` is the reserved sentinel carrying the "applies to every kind unless
/// overridden" entry; every kind-keyed mapping holds one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KindKey {
    All,
    Kind(ResourceKind),
}

impl KindKey {
    pub fn is_all(&self) -> bool {
        matches!(self, KindKey::All)
    }
}

impl From<ResourceKind> for KindKey {
    fn from(kind: ResourceKind) -> Self {
        KindKey::Kind(kind)
    }
}

impl fmt::Display for KindKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KindKey::All => write!(f, "*"),
            KindKey::Kind(k) => write!(f, "{k}"),
        }
    }
}

/// Namespace/name key addressing one object inside a per-kind store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    /// Extract the key from a raw object's metadata. Objects without a name
    /// are not addressable.
    pub fn from_raw(raw: &serde_json::Value) -> Option<Self> {
        let meta = raw.get("metadata")?;
        let name = meta.get("name").and_then(|v| v.as_str())?;
        let namespace = meta
            .get("namespace")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        Some(Self { namespace, name: name.to_string() })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Labels of a raw object as a plain map (absent metadata yields empty).
pub fn labels_of(raw: &serde_json::Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(labels) = raw.get("metadata").and_then(|m| m.get("labels")).and_then(|l| l.as_object()) {
        for (k, v) in labels {
            if let Some(s) = v.as_str() {
                out.insert(k.clone(), s.to_string());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_key_roundtrip() {
        let k = ResourceKind::parse("apps/v1/Deployment").unwrap();
        assert_eq!(k, ResourceKind::gvk("apps", "v1", "Deployment"));
        assert_eq!(k.to_string(), "apps/v1/Deployment");
        let core = ResourceKind::parse("v1/Pod").unwrap();
        assert_eq!(core, ResourceKind::core("v1", "Pod"));
        assert_eq!(core.to_string(), "v1/Pod");
        assert!(ResourceKind::parse("v1").is_err());
        assert!(ResourceKind::parse("a/b/c/d").is_err());
    }

    #[test]
    fn object_key_from_raw() {
        let raw = serde_json::json!({"metadata": {"name": "web", "namespace": "prod"}});
        assert_eq!(ObjectKey::from_raw(&raw), Some(ObjectKey::namespaced("prod", "web")));
        let cluster = serde_json::json!({"metadata": {"name": "node-1"}});
        assert_eq!(ObjectKey::from_raw(&cluster), Some(ObjectKey::cluster("node-1")));
        assert_eq!(ObjectKey::from_raw(&serde_json::json!({})), None);
    }
}
