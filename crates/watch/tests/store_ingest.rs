#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::core::ApiResource;
use kelpie_core::{KindKey, ObjectKey, ResourceKind, Transform};
use kelpie_watch::{ByKindConfig, MappedResource, ResourceMapper, StoreEventHandler, StoreSet, StoreSetOptions};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn offline_client() -> kube::Client {
    let config = kube::Config::new("http://127.0.0.1:8080".parse().unwrap());
    kube::Client::try_from(config).expect("offline client")
}

fn pod_kind() -> ResourceKind {
    ResourceKind::core("v1", "Pod")
}

fn pod_mapper() -> ResourceMapper {
    let mut mapper = ResourceMapper::default();
    mapper.insert(pod_kind(), MappedResource::namespaced(ApiResource::erase::<Pod>(&())));
    mapper
}

fn store_set(by_kind: ByKindConfig) -> StoreSet {
    StoreSet::new(StoreSetOptions {
        client: offline_client(),
        mapper: pod_mapper(),
        namespace: None,
        resync_every: Duration::from_secs(36000),
        by_kind,
    })
}

fn pod_raw(name: &str, ns: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": name, "namespace": ns, "labels": { "app": name } },
        "status": { "phase": "Running" },
    })
}

#[tokio::test]
async fn apply_get_list_roundtrip() {
    let set = store_set(ByKindConfig::default());
    let store = set.get_or_create(&pod_kind()).unwrap();

    store.apply(pod_raw("web-1", "prod"));
    store.apply(pod_raw("web-2", "prod"));
    assert_eq!(store.len(), 2);

    let got = store.get(&ObjectKey::namespaced("prod", "web-1")).expect("stored");
    assert_eq!(got["metadata"]["name"], "web-1");
    assert!(store.get(&ObjectKey::namespaced("prod", "missing")).is_none());

    store.delete(&pod_raw("web-1", "prod"));
    assert_eq!(store.len(), 1);
    assert_eq!(store.list().len(), 1);
}

#[tokio::test]
async fn get_or_create_is_idempotent_and_shared() {
    let set = store_set(ByKindConfig::default());
    let a = set.get_or_create(&pod_kind()).unwrap();
    let b = set.get_or_create(&pod_kind()).unwrap();

    a.apply(pod_raw("web-1", "prod"));
    assert_eq!(b.len(), 1, "both handles see the same store");
    assert_eq!(set.stores().len(), 1);
}

#[tokio::test]
async fn get_or_create_single_flight_under_contention() {
    let set = store_set(ByKindConfig::default());
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let set = set.clone();
        tasks.push(tokio::spawn(async move { set.get_or_create(&pod_kind()).unwrap() }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    assert_eq!(set.stores().len(), 1, "at most one store constructed per kind");
}

#[tokio::test]
async fn unmapped_kind_is_an_error() {
    let set = store_set(ByKindConfig::default());
    let err = set.get_or_create(&ResourceKind::core("v1", "Service")).unwrap_err();
    assert!(err.to_string().contains("no API resource mapped"), "got: {err}");
}

#[tokio::test]
async fn deep_copy_disabled_shares_the_stored_value() {
    let mut disabled_cfg = ByKindConfig::default();
    disabled_cfg.disable_deep_copy.insert(KindKey::All, true);
    let disabled = store_set(disabled_cfg).get_or_create(&pod_kind()).unwrap();
    let copied = store_set(ByKindConfig::default()).get_or_create(&pod_kind()).unwrap();

    let key = ObjectKey::namespaced("prod", "web-1");
    disabled.apply(pod_raw("web-1", "prod"));
    copied.apply(pod_raw("web-1", "prod"));

    let (a, b) = (disabled.get(&key).unwrap(), disabled.get(&key).unwrap());
    assert!(Arc::ptr_eq(&a, &b), "disabled deep copy shares the stored value");

    let (a, b) = (copied.get(&key).unwrap(), copied.get(&key).unwrap());
    assert!(!Arc::ptr_eq(&a, &b), "default reads are defensive copies");
}

#[tokio::test]
async fn transform_rewrites_or_skips_objects() {
    let mut cfg = ByKindConfig::default();
    cfg.transforms.insert(
        KindKey::All,
        Transform::new(|mut v| {
            if v["metadata"]["name"] == "poison" {
                anyhow::bail!("rejected");
            }
            v["metadata"].as_object_mut().unwrap().remove("labels");
            Ok(v)
        }),
    );
    let store = store_set(cfg).get_or_create(&pod_kind()).unwrap();

    store.apply(pod_raw("web-1", "prod"));
    store.apply(pod_raw("poison", "prod"));

    assert_eq!(store.len(), 1, "failing transform skips the object");
    let got = store.get(&ObjectKey::namespaced("prod", "web-1")).unwrap();
    assert!(got["metadata"].get("labels").is_none(), "transform ran before storage");
}

#[derive(Default)]
struct Recorder {
    applied: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl StoreEventHandler for Recorder {
    fn on_applied(&self, obj: &Arc<Value>) {
        self.applied.lock().unwrap().push(obj["metadata"]["name"].as_str().unwrap_or("").to_string());
    }

    fn on_deleted(&self, obj: &Arc<Value>) {
        self.deleted.lock().unwrap().push(obj["metadata"]["name"].as_str().unwrap_or("").to_string());
    }
}

#[tokio::test]
async fn event_handlers_at_most_once_and_removable() {
    let set = store_set(ByKindConfig::default());
    let store = set.get_or_create(&pod_kind()).unwrap();

    let recorder = Arc::new(Recorder::default());
    let reg = store.add_event_handler(recorder.clone());

    store.apply(pod_raw("web-1", "prod"));
    store.delete(&pod_raw("web-1", "prod"));
    assert_eq!(*recorder.applied.lock().unwrap(), vec!["web-1"]);
    assert_eq!(*recorder.deleted.lock().unwrap(), vec!["web-1"]);

    store.remove_event_handler(reg);
    store.remove_event_handler(reg); // removal is idempotent
    store.apply(pod_raw("web-2", "prod"));
    assert_eq!(recorder.applied.lock().unwrap().len(), 1, "removed handler sees nothing");
}

#[tokio::test]
async fn indices_must_precede_data() {
    let set = store_set(ByKindConfig::default());
    let store = set.get_or_create(&pod_kind()).unwrap();

    store
        .add_index(
            "by-phase",
            Arc::new(|obj: &Value| {
                obj.pointer("/status/phase").and_then(|v| v.as_str()).map(|s| vec![s.to_string()]).unwrap_or_default()
            }),
        )
        .unwrap();

    store.apply(pod_raw("web-1", "prod"));
    store.apply(pod_raw("web-2", "prod"));

    let running = store.by_index("by-phase", "Running").unwrap();
    assert_eq!(running.len(), 2);
    assert!(store.by_index("by-phase", "Pending").unwrap().is_empty());
    assert!(store.by_index("unknown", "x").is_err());

    let err = store.add_index("late", Arc::new(|_: &Value| Vec::new())).unwrap_err();
    assert!(err.to_string().contains("already has data"), "got: {err}");

    store.delete(&pod_raw("web-1", "prod"));
    assert_eq!(store.by_index("by-phase", "Running").unwrap().len(), 1);
}

#[tokio::test]
async fn replace_reconciles_contents_and_syncs() {
    let set = store_set(ByKindConfig::default());
    let store = set.get_or_create(&pod_kind()).unwrap();
    assert!(!store.has_synced());

    store.apply(pod_raw("stale", "prod"));
    store.replace(vec![pod_raw("web-1", "prod"), pod_raw("web-2", "prod")]);

    assert!(store.has_synced());
    assert_eq!(store.len(), 2);
    assert!(store.get(&ObjectKey::namespaced("prod", "stale")).is_none(), "stale objects dropped on relist");
}

fn two_kind_set() -> StoreSet {
    let mut mapper = pod_mapper();
    mapper.insert(
        ResourceKind::core("v1", "Service"),
        MappedResource::namespaced(ApiResource::erase::<Service>(&())),
    );
    StoreSet::new(StoreSetOptions {
        client: offline_client(),
        mapper,
        namespace: None,
        resync_every: Duration::from_secs(36000),
        by_kind: ByKindConfig::default(),
    })
}

#[tokio::test]
async fn wait_for_sync_sees_stores_added_while_waiting() {
    let set = two_kind_set();
    let pods = set.get_or_create(&pod_kind()).unwrap();

    let shutdown = CancellationToken::new();
    let waiter = {
        let set = set.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { set.wait_for_sync(&shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    let services = set.get_or_create(&ResourceKind::core("v1", "Service")).unwrap();
    pods.replace(vec![pod_raw("web-1", "prod")]);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished(), "store added while waiting still gates sync");

    services.replace(Vec::new());
    assert!(waiter.await.unwrap(), "sync reported once every store synced");
}

#[tokio::test]
async fn wait_for_sync_cancellation_reports_false() {
    let set = two_kind_set();
    set.get_or_create(&pod_kind()).unwrap();

    let shutdown = CancellationToken::new();
    let waiter = {
        let set = set.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { set.wait_for_sync(&shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown.cancel();
    assert!(!waiter.await.unwrap(), "cancellation reports false, not an error");
}
