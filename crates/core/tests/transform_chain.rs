#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kelpie_core::Transform;

fn append_stage(stage: &'static str) -> Transform {
    Transform::new(move |mut v| {
        v["stages"]
            .as_array_mut()
            .expect("stages array")
            .push(serde_json::Value::String(stage.to_string()));
        Ok(v)
    })
}

#[test]
fn chain_runs_inherited_first() {
    let chained = Transform::chain(&append_stage("inherited"), &append_stage("override"));
    let out = chained.apply(serde_json::json!({ "stages": [] })).unwrap();
    assert_eq!(out["stages"], serde_json::json!(["inherited", "override"]));

    // Three-way chaining keeps left-to-right order.
    let three = Transform::chain(&chained, &append_stage("outer"));
    let out = three.apply(serde_json::json!({ "stages": [] })).unwrap();
    assert_eq!(out["stages"], serde_json::json!(["inherited", "override", "outer"]));
}

#[test]
fn chain_absent_sides() {
    let only = append_stage("only");
    let out = Transform::chain(&Transform::none(), &only)
        .apply(serde_json::json!({ "stages": [] }))
        .unwrap();
    assert_eq!(out["stages"], serde_json::json!(["only"]));

    let out = Transform::chain(&only, &Transform::none())
        .apply(serde_json::json!({ "stages": [] }))
        .unwrap();
    assert_eq!(out["stages"], serde_json::json!(["only"]));

    assert!(Transform::chain(&Transform::none(), &Transform::none()).is_none());
}

#[test]
fn chain_short_circuits_on_inherited_failure() {
    let ran = Arc::new(AtomicBool::new(false));
    let ran_probe = Arc::clone(&ran);
    let failing = Transform::new(|_| anyhow::bail!("inherited failed"));
    let current = Transform::new(move |v| {
        ran_probe.store(true, Ordering::SeqCst);
        Ok(v)
    });

    let err = Transform::chain(&failing, &current)
        .apply(serde_json::json!({}))
        .unwrap_err();
    assert!(err.to_string().contains("inherited failed"));
    assert!(!ran.load(Ordering::SeqCst), "override must not run after inherited failure");
}

#[test]
fn strip_managed_fields_transform() {
    let raw = serde_json::json!({
        "metadata": { "name": "web", "managedFields": [{"manager": "kubectl"}] },
        "spec": {},
    });
    let out = Transform::strip_managed_fields().apply(raw).unwrap();
    assert!(out["metadata"].get("managedFields").is_none());
    assert_eq!(out["metadata"]["name"], "web");
}
