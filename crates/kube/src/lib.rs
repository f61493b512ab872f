//! Kubernetes adapter: serves the control-plane seam with kube-rs.
//!
//! One [`KubeStore`] serves one resource kind (built-in or CRD) through
//! dynamic objects; the client is injected, so the adapter never loads
//! kubeconfig or touches credentials itself.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    Client,
};
use serde_json::{json, Value};
use tracing::debug;

use konverge_api::{ControlPlane, KonvergeError, KonvergeResult, Metadata, Resource, StoredResource};

/// Split an `apiVersion` string into `(group, version)`.
///
/// ```
/// use konverge_kube::parse_api_version;
/// assert_eq!(parse_api_version("v1"), ("".to_string(), "v1".to_string()));
/// assert_eq!(
///     parse_api_version("mongodb.com/v1"),
///     ("mongodb.com".to_string(), "v1".to_string())
/// );
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Describe a served kind for [`KubeStore`], e.g.
/// `api_resource("mongodb.com/v1", "MongoDB", "mongodb")`.
pub fn api_resource(api_version: &str, kind: &str, plural: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind {
            group,
            version,
            kind: kind.to_string(),
        },
        plural,
    )
}

/// Control-plane adapter serving one resource kind through the Kubernetes
/// API server.
pub struct KubeStore {
    client: Client,
    types: ApiResource,
}

impl KubeStore {
    pub fn new(client: Client, types: ApiResource) -> Self {
        Self { client, types }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.types)
    }
}

#[async_trait::async_trait]
impl ControlPlane for KubeStore {
    async fn create(&self, desired: &Resource) -> KonvergeResult<StoredResource> {
        debug!(key = %desired.key(), kind = %self.types.kind, "kube: create");
        let obj = to_dynamic(desired, None, &self.types);
        let created = self
            .api(desired.namespace())
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_error(&desired.key(), e))?;
        from_dynamic(created)
    }

    async fn update(
        &self,
        resource_version: &str,
        desired: &Resource,
    ) -> KonvergeResult<StoredResource> {
        debug!(key = %desired.key(), rv = %resource_version, "kube: replace");
        let obj = to_dynamic(desired, Some(resource_version), &self.types);
        let replaced = self
            .api(desired.namespace())
            .replace(desired.name(), &PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_error(&desired.key(), e))?;
        from_dynamic(replaced)
    }

    async fn get(&self, namespace: &str, name: &str) -> KonvergeResult<StoredResource> {
        let fetched = self
            .api(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_error(&format!("{namespace}/{name}"), e))?;
        from_dynamic(fetched)
    }

    async fn delete(&self, namespace: &str, name: &str) -> KonvergeResult<()> {
        debug!(namespace, name, "kube: delete");
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(&format!("{namespace}/{name}"), e))
    }
}

fn non_empty(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map.clone())
    }
}

/// Shape a resource for the wire. Status is server-populated and never sent;
/// the version token rides in `metadata.resourceVersion` on replaces.
fn to_dynamic(resource: &Resource, version: Option<&str>, types: &ApiResource) -> DynamicObject {
    let metadata = ObjectMeta {
        name: Some(resource.name().to_string()),
        namespace: Some(resource.namespace().to_string()),
        labels: non_empty(&resource.metadata.labels),
        annotations: non_empty(&resource.metadata.annotations),
        resource_version: version.map(str::to_owned),
        ..Default::default()
    };
    DynamicObject {
        types: Some(TypeMeta {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
        }),
        metadata,
        data: json!({ "spec": resource.spec }),
    }
}

fn from_dynamic(obj: DynamicObject) -> KonvergeResult<StoredResource> {
    let meta = obj.metadata;
    let name = meta
        .name
        .ok_or_else(|| KonvergeError::Transport("stored object missing metadata.name".into()))?;
    let namespace = meta.namespace.unwrap_or_default();
    let resource_version = meta.resource_version.ok_or_else(|| {
        KonvergeError::Transport(format!(
            "stored object {namespace}/{name} missing resourceVersion"
        ))
    })?;
    let mut metadata = Metadata::new(namespace, name);
    metadata.labels = meta.labels.unwrap_or_default();
    metadata.annotations = meta.annotations.unwrap_or_default();
    let spec = obj.data.get("spec").cloned().unwrap_or(Value::Null);
    let status = obj.data.get("status").cloned();
    Ok(StoredResource {
        metadata,
        resource_version,
        spec,
        status,
    })
}

fn map_kube_error(key: &str, err: kube::Error) -> KonvergeError {
    match err {
        kube::Error::Api(e) if e.code == 409 => {
            KonvergeError::Conflict(format!("{key}: {}", e.message))
        }
        kube::Error::Api(e) if e.code == 404 => KonvergeError::NotFound(key.to_string()),
        other => KonvergeError::Transport(format!("{key}: {other}")),
    }
}
