//! Konverge public API seam.
//!
//! This crate defines the error taxonomy and the `ControlPlane` trait the
//! apply engine is built against. Implementations can be in-memory (tests)
//! or a real control plane (the kube adapter crate).

#![forbid(unsafe_code)]

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::debug;

pub use konverge_core::{Binding, Metadata, Resource, StoredResource};

/// Errors surfaced by stores and the apply engine. `Conflict` is the only
/// class the apply loop retries; everything else is fatal to the operation
/// that hit it.
#[derive(Debug, thiserror::Error)]
pub enum KonvergeError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("merge exhausted for {key} after {attempts} attempts")]
    MergeExhausted { key: String, attempts: u32 },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("transport: {0}")]
    Transport(String),
}

pub type KonvergeResult<T> = Result<T, KonvergeError>;

/// Versioned store seam. Creates and updates enforce optimistic concurrency
/// through the opaque version token every stored object carries.
///
/// Implementations are injected into the apply engine at construction; the
/// library itself owns no endpoints or credentials.
#[async_trait::async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create a new object; `Conflict` if the identity is already taken.
    async fn create(&self, desired: &Resource) -> KonvergeResult<StoredResource>;

    /// Replace the stored object, presenting the version token the caller
    /// last synchronized with. `Conflict` on a stale token, `NotFound` if
    /// the identity vanished. The stored status is never taken from
    /// `desired`.
    async fn update(
        &self,
        resource_version: &str,
        desired: &Resource,
    ) -> KonvergeResult<StoredResource>;

    /// Fetch by identity.
    async fn get(&self, namespace: &str, name: &str) -> KonvergeResult<StoredResource>;

    /// Remove by identity; `NotFound` if absent.
    async fn delete(&self, namespace: &str, name: &str) -> KonvergeResult<()>;
}

// ----------------- In-memory implementation -----------------

/// In-memory versioned store with control-plane conflict semantics.
///
/// Tests drive the apply engine against it, and it doubles as the reference
/// behavior for adapter implementations: any accepted write assigns a fresh
/// version token, and writes presenting a stale token are rejected.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<(String, String), StoredResource>,
    next_version: u64,
}

impl Inner {
    fn next_token(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an out-of-band write, as another client of the store would.
    /// The mutation sees the stored object (status included) and the store
    /// assigns a fresh version token afterwards.
    pub async fn mutate<F>(&self, namespace: &str, name: &str, f: F) -> KonvergeResult<()>
    where
        F: FnOnce(&mut StoredResource),
    {
        let mut inner = self.inner.lock().await;
        let token = inner.next_token();
        let obj = inner
            .objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| KonvergeError::NotFound(format!("{namespace}/{name}")))?;
        f(obj);
        obj.resource_version = token;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ControlPlane for MemoryStore {
    async fn create(&self, desired: &Resource) -> KonvergeResult<StoredResource> {
        let mut inner = self.inner.lock().await;
        let key = (desired.namespace().to_string(), desired.name().to_string());
        if inner.objects.contains_key(&key) {
            return Err(KonvergeError::Conflict(format!(
                "{} already exists",
                desired.key()
            )));
        }
        let token = inner.next_token();
        let stored = StoredResource {
            metadata: desired.metadata.clone(),
            resource_version: token,
            spec: desired.spec.clone(),
            status: None,
        };
        debug!(key = %stored.key(), rv = %stored.resource_version, "memory store: create");
        inner.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        resource_version: &str,
        desired: &Resource,
    ) -> KonvergeResult<StoredResource> {
        let mut inner = self.inner.lock().await;
        let token = inner.next_token();
        let obj = inner
            .objects
            .get_mut(&(desired.namespace().to_string(), desired.name().to_string()))
            .ok_or_else(|| KonvergeError::NotFound(desired.key()))?;
        if obj.resource_version != resource_version {
            return Err(KonvergeError::Conflict(format!(
                "stale version for {}: presented {}, stored {}",
                desired.key(),
                resource_version,
                obj.resource_version
            )));
        }
        obj.metadata = desired.metadata.clone();
        obj.spec = desired.spec.clone();
        obj.resource_version = token;
        debug!(key = %obj.key(), rv = %obj.resource_version, "memory store: update");
        Ok(obj.clone())
    }

    async fn get(&self, namespace: &str, name: &str) -> KonvergeResult<StoredResource> {
        let inner = self.inner.lock().await;
        inner
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| KonvergeError::NotFound(format!("{namespace}/{name}")))
    }

    async fn delete(&self, namespace: &str, name: &str) -> KonvergeResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .objects
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| KonvergeError::NotFound(format!("{namespace}/{name}")))
    }
}
