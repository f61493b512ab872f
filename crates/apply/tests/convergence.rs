#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use konverge_api::{
    ControlPlane, KonvergeError, KonvergeResult, MemoryStore, Metadata, Resource, StoredResource,
};
use konverge_apply::Applier;
use serde_json::json;

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

fn database(name: &str) -> Resource {
    Resource::new("team-a", name, json!({"members": 3, "version": "6.0.0"}))
}

fn bound(name: &str, rv: &str) -> Resource {
    Resource::from(StoredResource {
        metadata: Metadata::new("team-a", name),
        resource_version: rv.into(),
        spec: json!({"members": 3, "version": "6.0.0"}),
        status: None,
    })
}

/// Forwards to an inner store, counting calls per operation.
struct CountingStore {
    inner: MemoryStore,
    creates: AtomicU32,
    updates: AtomicU32,
    gets: AtomicU32,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            creates: AtomicU32::new(0),
            updates: AtomicU32::new(0),
            gets: AtomicU32::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ControlPlane for CountingStore {
    async fn create(&self, desired: &Resource) -> KonvergeResult<StoredResource> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create(desired).await
    }

    async fn update(
        &self,
        resource_version: &str,
        desired: &Resource,
    ) -> KonvergeResult<StoredResource> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update(resource_version, desired).await
    }

    async fn get(&self, namespace: &str, name: &str) -> KonvergeResult<StoredResource> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(namespace, name).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> KonvergeResult<()> {
        self.inner.delete(namespace, name).await
    }
}

/// Every write conflicts; reads serve a fresh copy with a new token, like a
/// store some hyperactive writer keeps touching.
#[derive(Default)]
struct ContendedStore {
    updates: AtomicU32,
    gets: AtomicU32,
}

#[async_trait::async_trait]
impl ControlPlane for ContendedStore {
    async fn create(&self, desired: &Resource) -> KonvergeResult<StoredResource> {
        Err(KonvergeError::Conflict(format!(
            "{} already exists",
            desired.key()
        )))
    }

    async fn update(
        &self,
        _resource_version: &str,
        desired: &Resource,
    ) -> KonvergeResult<StoredResource> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Err(KonvergeError::Conflict(format!(
            "stale version for {}",
            desired.key()
        )))
    }

    async fn get(&self, namespace: &str, name: &str) -> KonvergeResult<StoredResource> {
        let n = self.gets.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(StoredResource {
            metadata: Metadata::new(namespace, name),
            resource_version: format!("contended-{n}"),
            spec: json!({}),
            status: None,
        })
    }

    async fn delete(&self, namespace: &str, name: &str) -> KonvergeResult<()> {
        Err(KonvergeError::NotFound(format!("{namespace}/{name}")))
    }
}

/// Writes fail with a non-conflict error.
#[derive(Default)]
struct BrokenStore {
    updates: AtomicU32,
    gets: AtomicU32,
}

#[async_trait::async_trait]
impl ControlPlane for BrokenStore {
    async fn create(&self, _desired: &Resource) -> KonvergeResult<StoredResource> {
        Err(KonvergeError::Transport("connection reset by peer".into()))
    }

    async fn update(
        &self,
        _resource_version: &str,
        _desired: &Resource,
    ) -> KonvergeResult<StoredResource> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Err(KonvergeError::Transport("connection reset by peer".into()))
    }

    async fn get(&self, namespace: &str, name: &str) -> KonvergeResult<StoredResource> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Err(KonvergeError::NotFound(format!("{namespace}/{name}")))
    }

    async fn delete(&self, namespace: &str, name: &str) -> KonvergeResult<()> {
        Err(KonvergeError::NotFound(format!("{namespace}/{name}")))
    }
}

/// Create conflicts but the object is gone by the follow-up load.
struct VanishingStore;

#[async_trait::async_trait]
impl ControlPlane for VanishingStore {
    async fn create(&self, desired: &Resource) -> KonvergeResult<StoredResource> {
        Err(KonvergeError::Conflict(format!(
            "{} already exists",
            desired.key()
        )))
    }

    async fn update(
        &self,
        _resource_version: &str,
        _desired: &Resource,
    ) -> KonvergeResult<StoredResource> {
        Err(KonvergeError::Transport("unexpected update".into()))
    }

    async fn get(&self, namespace: &str, name: &str) -> KonvergeResult<StoredResource> {
        Err(KonvergeError::NotFound(format!("{namespace}/{name}")))
    }

    async fn delete(&self, namespace: &str, name: &str) -> KonvergeResult<()> {
        Err(KonvergeError::NotFound(format!("{namespace}/{name}")))
    }
}

#[tokio::test]
async fn apply_creates_then_get_matches_spec() {
    init_logs();
    let store = Arc::new(MemoryStore::new());
    let applier = Applier::new(store.clone());

    let applied = applier.apply_or_update(database("db")).await.unwrap();
    assert!(applied.is_bound());

    let stored = store.get("team-a", "db").await.unwrap();
    assert_eq!(stored.spec, applied.spec);
    assert_eq!(stored.spec, json!({"members": 3, "version": "6.0.0"}));
}

#[tokio::test]
async fn second_apply_succeeds_without_reload() {
    init_logs();
    let store = Arc::new(CountingStore::new());
    let applier = Applier::new(store.clone());

    let first = applier.apply_or_update(database("db")).await.unwrap();
    let second = applier.apply_or_update(first).await.unwrap();
    assert!(second.is_bound());
    assert_eq!(second.spec, json!({"members": 3, "version": "6.0.0"}));

    assert_eq!(store.creates.load(Ordering::SeqCst), 1);
    assert_eq!(store.updates.load(Ordering::SeqCst), 1);
    // no conflict, so no reload-and-merge round trip
    assert_eq!(store.gets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn racing_annotation_survives_next_to_ours() {
    init_logs();
    let store = Arc::new(MemoryStore::new());
    let applier = Applier::new(store.clone());

    let handle = applier
        .apply_or_update(database("db").with_annotation("owner", "tests"))
        .await
        .unwrap();

    // another writer annotates the object after our copy was synced
    store
        .mutate("team-a", "db", |o| {
            o.metadata.annotations.insert("x".into(), "y".into());
        })
        .await
        .unwrap();

    let handle = applier
        .apply_or_update(handle.with_annotation("rollout", "blue"))
        .await
        .unwrap();
    assert!(handle.is_bound());

    let stored = store.get("team-a", "db").await.unwrap();
    let annotations = &stored.metadata.annotations;
    assert_eq!(annotations.get("x").map(String::as_str), Some("y"));
    assert_eq!(annotations.get("owner").map(String::as_str), Some("tests"));
    assert_eq!(annotations.get("rollout").map(String::as_str), Some("blue"));
}

#[tokio::test]
async fn desired_spec_wins_over_racing_writer() {
    init_logs();
    let store = Arc::new(MemoryStore::new());
    let applier = Applier::new(store.clone());

    let handle = applier.apply_or_update(database("db")).await.unwrap();

    // racing writer rewrites the spec and adds a label
    store
        .mutate("team-a", "db", |o| {
            o.spec = json!({"members": 7});
            o.metadata.labels.insert("touched-by".into(), "racer".into());
        })
        .await
        .unwrap();

    let applied = applier.apply_or_update(handle).await.unwrap();

    let stored = store.get("team-a", "db").await.unwrap();
    assert_eq!(stored.spec, json!({"members": 3, "version": "6.0.0"}));
    assert_eq!(
        stored.metadata.labels.get("touched-by").map(String::as_str),
        Some("racer")
    );
    assert_eq!(applied.spec, stored.spec);
}

#[tokio::test]
async fn sustained_contention_stops_after_ten_writes() {
    init_logs();
    let store = Arc::new(ContendedStore::default());
    let applier = Applier::new(store.clone());

    let err = applier.apply_or_update(bound("db", "1")).await.unwrap_err();
    match err {
        KonvergeError::MergeExhausted { attempts, .. } => assert_eq!(attempts, 10),
        other => panic!("expected merge exhaustion, got {other}"),
    }

    assert_eq!(store.updates.load(Ordering::SeqCst), 10);
    // every attempt after the first reloads before writing
    assert_eq!(store.gets.load(Ordering::SeqCst), 9);
}

#[tokio::test]
async fn retry_ceiling_is_configurable() {
    init_logs();
    let store = Arc::new(ContendedStore::default());
    let applier = Applier::new(store.clone()).with_max_attempts(3);

    let err = applier.apply_or_update(bound("db", "1")).await.unwrap_err();
    assert!(matches!(
        err,
        KonvergeError::MergeExhausted { attempts: 3, .. }
    ));
    assert_eq!(store.updates.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn transport_failure_short_circuits_without_reload() {
    init_logs();
    let store = Arc::new(BrokenStore::default());
    let applier = Applier::new(store.clone());

    let err = applier.apply_or_update(bound("db", "1")).await.unwrap_err();
    assert!(matches!(err, KonvergeError::Transport(_)), "got {err}");

    assert_eq!(store.updates.load(Ordering::SeqCst), 1);
    assert_eq!(store.gets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn update_after_external_delete_is_fatal() {
    init_logs();
    let store = Arc::new(MemoryStore::new());
    let applier = Applier::new(store.clone());

    let handle = applier.apply_or_update(database("db")).await.unwrap();
    store.delete("team-a", "db").await.unwrap();

    let err = applier.apply_or_update(handle).await.unwrap_err();
    assert!(matches!(err, KonvergeError::NotFound(_)), "got {err}");
}

#[tokio::test]
async fn create_collision_converges_onto_existing_object() {
    init_logs();
    let store = Arc::new(MemoryStore::new());
    let applier = Applier::new(store.clone());

    // someone else created the object, with their own label
    applier
        .apply_or_update(database("db").with_label("created-by", "them"))
        .await
        .unwrap();

    // our handle never saw it: the unbound apply hits the create conflict
    let applied = applier
        .apply_or_update(database("db").with_annotation("owner", "us"))
        .await
        .unwrap();
    assert!(applied.is_bound());

    let stored = store.get("team-a", "db").await.unwrap();
    assert_eq!(
        stored.metadata.labels.get("created-by").map(String::as_str),
        Some("them")
    );
    assert_eq!(
        stored.metadata.annotations.get("owner").map(String::as_str),
        Some("us")
    );
    assert_eq!(stored.spec, json!({"members": 3, "version": "6.0.0"}));
}

#[tokio::test]
async fn create_collision_with_vanished_object_is_fatal() {
    init_logs();
    let applier = Applier::new(Arc::new(VanishingStore));

    let err = applier.apply_or_update(database("db")).await.unwrap_err();
    assert!(matches!(err, KonvergeError::NotFound(_)), "got {err}");
}
