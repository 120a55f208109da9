//! # Convergence Store
//!
//! Abstraction over the cluster's declarative store.
//!
//! Every controller talks to the API server through [`ConvergenceClient`], an object-safe
//! async trait over [`DynamicObject`]. Two implementations exist:
//!
//! - [`KubeStore`] - backed by a `kube::Client`
//! - [`InMemoryStore`] - a resourceVersion-checking map used by tests
//!
//! Objects handed to `create`, `update` and `update_status` must carry `types`
//! (apiVersion and kind); typed resources should go through [`to_dynamic`].

mod cluster;
mod ensure;
mod memory;

pub use cluster::KubeStore;
pub use ensure::{ensure, Desired, EnsureOutcome, Mutator};
pub use memory::{InMemoryStore, WriteOp};

use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Shared handle to the store used by every reconciler
pub type SharedClient = Arc<dyn ConvergenceClient>;

/// Errors returned by the store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("conflict writing {0}: the object has been modified")]
    Conflict(String),
    #[error("object is missing {0}")]
    Incomplete(&'static str),
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// Delete propagation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationPolicy {
    /// Dependents are deleted before the owner disappears
    Foreground,
    Background,
    Orphan,
}

/// Identifies one object in the store
#[derive(Debug, Clone)]
pub struct ObjectKey {
    pub resource: ApiResource,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(resource: ApiResource, namespace: Option<&str>, name: &str) -> Self {
        Self {
            resource,
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Key of a typed namespaced resource
    pub fn of<K>(namespace: &str, name: &str) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self::new(ApiResource::erase::<K>(&()), Some(namespace), name)
    }

    /// Key of an object already holding its type and metadata
    pub fn for_object(obj: &DynamicObject) -> Result<Self, StoreError> {
        let resource = api_resource_of(obj)?;
        let name = obj
            .metadata
            .name
            .as_deref()
            .ok_or(StoreError::Incomplete("metadata.name"))?;
        Ok(Self::new(resource, obj.metadata.namespace.as_deref(), name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.resource.kind, ns, self.name),
            None => write!(f, "{} {}", self.resource.kind, self.name),
        }
    }
}

/// Access to the declarative store
///
/// All calls may fail transiently; callers requeue on any error other than the
/// ones they handle explicitly.
#[async_trait]
pub trait ConvergenceClient: Send + Sync {
    /// Fetch one object; `None` when it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError>;

    /// List objects of a resource, optionally within a namespace and matching a label selector
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    /// Create an object; fails with `AlreadyExists` if it is present
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Replace an object's spec and metadata; fails with `Conflict` on a stale resourceVersion
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Replace an object's status; fails with `Conflict` on a stale resourceVersion
    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Delete an object; deleting an absent object succeeds
    async fn delete(&self, key: &ObjectKey, policy: PropagationPolicy) -> Result<(), StoreError>;
}

/// Split an apiVersion into (group, version); the core group is empty
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Resolve the API resource of an object from its type metadata
pub fn api_resource_of(obj: &DynamicObject) -> Result<ApiResource, StoreError> {
    let types = obj.types.as_ref().ok_or(StoreError::Incomplete("types"))?;
    let (group, version) = split_api_version(&types.api_version);
    Ok(ApiResource::from_gvk(&GroupVersionKind::gvk(
        group,
        version,
        &types.kind,
    )))
}

/// Convert a typed resource into a dynamic object carrying its type metadata
pub fn to_dynamic<K>(obj: &K) -> Result<DynamicObject, StoreError>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let mut dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
    dynamic.types = Some(TypeMeta {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
    });
    Ok(dynamic)
}

/// Parse a dynamic object into a typed resource
pub fn from_dynamic<K>(obj: &DynamicObject) -> Result<K, StoreError>
where
    K: DeserializeOwned,
{
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Fetch a typed object
pub async fn get_as<K>(
    client: &dyn ConvergenceClient,
    namespace: &str,
    name: &str,
) -> Result<Option<K>, StoreError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    client
        .get(&ObjectKey::of::<K>(namespace, name))
        .await?
        .map(|obj| from_dynamic(&obj))
        .transpose()
}

/// List typed objects
pub async fn list_as<K>(
    client: &dyn ConvergenceClient,
    namespace: Option<&str>,
    label_selector: Option<&str>,
) -> Result<Vec<K>, StoreError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    client
        .list(&ApiResource::erase::<K>(&()), namespace, label_selector)
        .await?
        .iter()
        .map(from_dynamic)
        .collect()
}

/// Persist the status of a typed object
pub async fn update_status_as<K>(client: &dyn ConvergenceClient, obj: &K) -> Result<K, StoreError>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    let written = client.update_status(&to_dynamic(obj)?).await?;
    from_dynamic(&written)
}

/// Persist the spec and metadata of a typed object
pub async fn update_as<K>(client: &dyn ConvergenceClient, obj: &K) -> Result<K, StoreError>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    let written = client.update(&to_dynamic(obj)?).await?;
    from_dynamic(&written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    #[test]
    fn test_split_api_version() {
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(split_api_version("v1"), ("", "v1"));
        assert_eq!(
            split_api_version("apps.apimanager.dev/v1alpha1"),
            ("apps.apimanager.dev", "v1alpha1")
        );
    }

    #[test]
    fn test_typed_round_trip_keeps_type_meta() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".to_string()),
                namespace: Some("api".to_string()),
                ..ObjectMeta::default()
            },
            data: Some([("key".to_string(), "value".to_string())].into()),
            ..ConfigMap::default()
        };
        let dynamic = to_dynamic(&cm).unwrap();
        let key = ObjectKey::for_object(&dynamic).unwrap();
        assert_eq!(key.resource.kind, "ConfigMap");
        assert_eq!(key.to_string(), "ConfigMap api/settings");

        let back: ConfigMap = from_dynamic(&dynamic).unwrap();
        assert_eq!(back.data, cm.data);
    }
}
