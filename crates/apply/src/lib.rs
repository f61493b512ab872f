//! Konverge apply engine: converge stored documents onto caller-desired
//! state under optimistic concurrency, with a bounded conflict-retry loop.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tracing::{debug, warn};

use konverge_api::{Binding, ControlPlane, KonvergeError, KonvergeResult, Resource, StoredResource};

/// Retry ceiling when every write attempt conflicts.
pub const DEFAULT_MAX_MERGE_ATTEMPTS: u32 = 10;

/// Default pacing for [`wait_for`] probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

fn default_max_attempts() -> u32 {
    std::env::var("KONVERGE_MAX_MERGE_ATTEMPTS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(DEFAULT_MAX_MERGE_ATTEMPTS)
        .max(1)
}

/// Applies desired resource state against a store that other writers may be
/// mutating concurrently.
pub struct Applier {
    store: Arc<dyn ControlPlane>,
    max_attempts: u32,
}

impl Applier {
    /// Retry ceiling comes from `KONVERGE_MAX_MERGE_ATTEMPTS` (default 10).
    pub fn new(store: Arc<dyn ControlPlane>) -> Self {
        Self {
            store,
            max_attempts: default_max_attempts(),
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Create the resource if the handle is unbound, otherwise converge the
    /// stored copy onto the caller's desired state, absorbing version
    /// conflicts by reloading and merging.
    ///
    /// Returns the handle as the store accepted it: bound, carrying the
    /// fresh version token and the latest stored status.
    pub async fn apply_or_update(&self, resource: Resource) -> KonvergeResult<Resource> {
        let t0 = Instant::now();
        counter!("apply_attempts", 1u64);
        let res = self.apply_inner(resource).await;
        match &res {
            Ok(applied) => {
                histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("apply_ok", 1u64);
                debug!(key = %applied.key(), rv = ?applied.resource_version(), "apply ok");
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(error = %e, "apply failed");
            }
        }
        res
    }

    async fn apply_inner(&self, mut resource: Resource) -> KonvergeResult<Resource> {
        let binding = resource.binding().clone();
        match binding {
            Binding::Bound { resource_version } => self.converge(resource, resource_version).await,
            Binding::Unbound => {
                debug!(key = %resource.key(), "creating unbound resource");
                match self.store.create(&resource).await {
                    Ok(stored) => {
                        resource.update_from(stored);
                        Ok(resource)
                    }
                    Err(KonvergeError::Conflict(reason)) => {
                        // Identity collision: another writer created it first.
                        // Load their copy and converge onto it instead of
                        // overwriting blind.
                        warn!(key = %resource.key(), reason = %reason, "create conflicted; converging onto existing object");
                        counter!("apply_create_conflict_total", 1u64);
                        let remote = self
                            .store
                            .get(resource.namespace(), resource.name())
                            .await?;
                        let version = remote.resource_version.clone();
                        let merged = merge(&resource, remote);
                        self.converge(merged, version).await
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Bounded optimistic-concurrency write loop. Attempt 0 writes the
    /// handle as-is; later attempts reload the stored copy and merge first.
    async fn converge(&self, mut resource: Resource, mut version: String) -> KonvergeResult<Resource> {
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let remote = self
                    .store
                    .get(resource.namespace(), resource.name())
                    .await?;
                version = remote.resource_version.clone();
                resource = merge(&resource, remote);
                counter!("apply_merge_total", 1u64);
            }
            match self.store.update(&version, &resource).await {
                Ok(stored) => {
                    resource.update_from(stored);
                    return Ok(resource);
                }
                Err(KonvergeError::Conflict(reason)) => {
                    warn!(key = %resource.key(), attempt, reason = %reason, "update conflicted with a concurrent writer");
                    counter!("apply_conflict_total", 1u64);
                }
                Err(e) => return Err(e),
            }
        }
        Err(KonvergeError::MergeExhausted {
            key: resource.key(),
            attempts: self.max_attempts,
        })
    }

    /// Existence probe: fetch by the handle's identity.
    ///
    /// `true` populates the handle with the stored copy and binds it.
    /// `false` means no stored counterpart; the handle is left untouched.
    /// Any error other than absence propagates.
    pub async fn try_load(&self, resource: &mut Resource) -> KonvergeResult<bool> {
        match self.store.get(resource.namespace(), resource.name()).await {
            Ok(stored) => {
                resource.update_from(stored);
                Ok(true)
            }
            Err(KonvergeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete the stored counterpart if it exists. `true` when a stored copy
    /// was removed, `false` when none existed. The handle ends up unbound
    /// either way: with nothing stored, the next apply takes the create path.
    pub async fn ensure_absent(&self, resource: &mut Resource) -> KonvergeResult<bool> {
        let removed = match self.store.delete(resource.namespace(), resource.name()).await {
            Ok(()) => true,
            Err(KonvergeError::NotFound(_)) => false,
            Err(e) => return Err(e),
        };
        resource.unbind();
        debug!(key = %resource.key(), removed, "ensure absent");
        Ok(removed)
    }
}

/// Lay caller-desired state over the latest stored copy.
///
/// The result adopts the stored copy's version token and status, takes the
/// desired spec wholesale, and overlays desired labels and annotations onto
/// the stored maps key by key, keeping entries other writers added.
pub fn merge(desired: &Resource, remote: StoredResource) -> Resource {
    let mut merged = Resource::from(remote);
    merged.spec = desired.spec.clone();
    for (k, v) in &desired.metadata.labels {
        merged.metadata.labels.insert(k.clone(), v.clone());
    }
    for (k, v) in &desired.metadata.annotations {
        merged.metadata.annotations.insert(k.clone(), v.clone());
    }
    merged
}

/// Poll the store until the stored copy satisfies `predicate`, then return
/// it. Absence keeps polling (the object may not exist yet); any other error
/// is fatal. The probe runs at least once regardless of `timeout`.
pub async fn wait_for<P>(
    store: &dyn ControlPlane,
    namespace: &str,
    name: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut predicate: P,
) -> KonvergeResult<StoredResource>
where
    P: FnMut(&StoredResource) -> bool,
{
    let start = Instant::now();
    loop {
        match store.get(namespace, name).await {
            Ok(stored) if predicate(&stored) => return Ok(stored),
            Ok(stored) => {
                debug!(key = %stored.key(), "condition not met yet");
            }
            Err(KonvergeError::NotFound(_)) => {
                debug!(namespace, name, "not stored yet");
            }
            Err(e) => return Err(e),
        }
        if start.elapsed() >= timeout {
            return Err(KonvergeError::Timeout(format!(
                "condition not met for {namespace}/{name} within {timeout:?}"
            )));
        }
        tokio::time::sleep(poll_interval).await;
    }
}
