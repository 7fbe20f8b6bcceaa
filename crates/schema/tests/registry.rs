#![forbid(unsafe_code)]

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kelpie_core::ResourceKind;
use kelpie_schema::{SchemaError, SchemaRegistry};

#[test]
fn identity_kind_roundtrip() {
    let reg = SchemaRegistry::default().with::<Pod>().with::<Deployment>();

    let kind = reg.kind_for(&Pod::default()).unwrap();
    assert_eq!(kind, ResourceKind::core("v1", "Pod"));

    let identity = reg.identity_for(&kind).unwrap();
    assert!(identity.as_any().downcast_ref::<Pod>().is_some(), "round-trip yields the same concrete type");
    assert_eq!(identity.resource_kind(), kind);

    let kind = reg.kind_for(&Deployment::default()).unwrap();
    assert_eq!(kind, ResourceKind::gvk("apps", "v1", "Deployment"));
}

#[test]
fn unregistered_type_fails_kind_resolution() {
    let reg = SchemaRegistry::default().with::<Pod>();
    let err = reg.kind_for(&ConfigMap::default()).unwrap_err();
    assert!(matches!(err, SchemaError::KindResolution(_)), "got: {err}");

    let err = reg.identity_for(&ResourceKind::core("v1", "ConfigMap")).unwrap_err();
    assert!(matches!(err, SchemaError::KindResolution(_)), "got: {err}");
}

#[test]
fn dynamic_kind_has_no_identity_capability() {
    let mut reg = SchemaRegistry::new();
    let crd = ResourceKind::gvk("example.io", "v1", "Widget");
    reg.register_kind(crd.clone());

    assert!(reg.has_kind(&crd));
    let err = reg.identity_for(&crd).unwrap_err();
    assert!(matches!(err, SchemaError::Capability(_)), "got: {err}");
}

#[test]
fn union_merges_and_override_wins() {
    let a = SchemaRegistry::default().with::<Pod>();
    let b = SchemaRegistry::default().with::<Deployment>();

    let merged = SchemaRegistry::union(Some(&a), Some(&b)).unwrap();
    assert!(merged.has_kind(&ResourceKind::core("v1", "Pod")));
    assert!(merged.has_kind(&ResourceKind::gvk("apps", "v1", "Deployment")));
    assert_eq!(merged.len(), 2);

    assert!(SchemaRegistry::union(None, None).is_none());
    let only = SchemaRegistry::union(Some(&a), None).unwrap();
    assert!(only.has_kind(&ResourceKind::core("v1", "Pod")));
    assert_eq!(only.len(), 1);
}

#[test]
fn core_kinds_cover_the_builtins() {
    let reg = SchemaRegistry::core_kinds();
    for key in ["v1/Pod", "v1/ConfigMap", "apps/v1/Deployment", "batch/v1/Job"] {
        let kind = ResourceKind::parse(key).unwrap();
        assert!(reg.has_kind(&kind), "missing {key}");
        assert!(reg.identity_for(&kind).is_ok());
    }
}
