//! Konverge core types: resource documents and their store bindings.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity and caller-mergeable metadata of a resource document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// `namespace/name`, the identity used in logs and error messages.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Whether a local handle has been matched to a stored counterpart.
///
/// `Bound` carries the version token of the stored copy the handle was last
/// synchronized with; writes present it and the store rejects stale tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Binding {
    /// Never created, loaded, or applied. The next apply takes the create path.
    #[default]
    Unbound,
    /// Tracks a stored object at the given version token.
    Bound { resource_version: String },
}

impl Binding {
    pub fn is_bound(&self) -> bool {
        matches!(self, Binding::Bound { .. })
    }
}

/// Caller-side handle for a resource document.
///
/// `spec` is client-owned: merges always keep the local copy. `status` is
/// remote-owned: the client never writes it and merges always adopt the
/// stored copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub metadata: Metadata,
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(default)]
    binding: Binding,
}

impl Resource {
    /// New unbound handle with the given desired spec.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: Value) -> Self {
        Self {
            metadata: Metadata::new(namespace, name),
            spec,
            status: None,
            binding: Binding::Unbound,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.annotations.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn key(&self) -> String {
        self.metadata.key()
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }

    /// Version token of the stored counterpart, if bound.
    pub fn resource_version(&self) -> Option<&str> {
        match &self.binding {
            Binding::Bound { resource_version } => Some(resource_version),
            Binding::Unbound => None,
        }
    }

    /// Overwrite this handle with the store's copy and bind to its token.
    ///
    /// Used after every successful store round-trip: the stored document is
    /// the source of truth for everything, including fields another writer
    /// touched since the last synchronization.
    pub fn update_from(&mut self, stored: StoredResource) {
        self.metadata = stored.metadata;
        self.spec = stored.spec;
        self.status = stored.status;
        self.binding = Binding::Bound {
            resource_version: stored.resource_version,
        };
    }

    /// Drop the store binding; the next apply takes the create path.
    pub fn unbind(&mut self) {
        self.binding = Binding::Unbound;
    }
}

/// A document as the store returned it. The store never hands back an
/// unversioned object, so the token is not optional here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredResource {
    pub metadata: Metadata,
    pub resource_version: String,
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

impl StoredResource {
    pub fn key(&self) -> String {
        self.metadata.key()
    }
}

impl From<StoredResource> for Resource {
    fn from(stored: StoredResource) -> Self {
        Self {
            metadata: stored.metadata,
            spec: stored.spec,
            status: stored.status,
            binding: Binding::Bound {
                resource_version: stored.resource_version,
            },
        }
    }
}
