//! # In-Memory Store
//!
//! A [`ConvergenceClient`] keeping objects in a map, with the API server's optimistic
//! concurrency semantics:
//!
//! - every write bumps a global resourceVersion
//! - `update` and `update_status` carrying a stale resourceVersion fail with `Conflict`
//! - `update` never touches status, `update_status` touches nothing else
//! - `create` drops any status and assigns a UID
//!
//! Every write is recorded so tests can assert on exactly which calls a reconcile issued.

use super::{
    from_dynamic, split_api_version, to_dynamic, ConvergenceClient, ObjectKey, PropagationPolicy,
    StoreError,
};
use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A write issued against the store, identified as `Kind namespace/name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Create(String),
    Update(String),
    UpdateStatus(String),
    Delete(String),
}

impl WriteOp {
    pub fn target(&self) -> &str {
        match self {
            Self::Create(t) | Self::Update(t) | Self::UpdateStatus(t) | Self::Delete(t) => t,
        }
    }
}

/// (group, kind, namespace, name)
type StoreKey = (String, String, String, String);

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<StoreKey, DynamicObject>,
    revision: u64,
    writes: Vec<WriteOp>,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

/// Thread-safe in-memory store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

fn key_of(key: &ObjectKey) -> StoreKey {
    (
        key.resource.group.clone(),
        key.resource.kind.clone(),
        key.namespace.clone().unwrap_or_default(),
        key.name.clone(),
    )
}

fn key_of_object(obj: &DynamicObject) -> Result<(StoreKey, String), StoreError> {
    let types = obj.types.as_ref().ok_or(StoreError::Incomplete("types"))?;
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or(StoreError::Incomplete("metadata.name"))?;
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    let (group, _) = split_api_version(&types.api_version);
    let label = format!("{} {namespace}/{name}", types.kind);
    Ok((
        (group.to_string(), types.kind.clone(), namespace, name),
        label,
    ))
}

fn labels_match(obj: &DynamicObject, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => labels.contains_key(term),
        })
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an object as if another actor had created it; not recorded as a write
    pub fn seed(&self, mut obj: DynamicObject) -> Result<(), StoreError> {
        let (key, _) = key_of_object(&obj)?;
        let mut state = self.state();
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        obj.metadata.resource_version = Some(state.next_revision());
        state.objects.insert(key, obj);
        Ok(())
    }

    /// Seed a typed object
    pub fn seed_typed<K>(&self, obj: &K) -> Result<(), StoreError>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        self.seed(to_dynamic(obj)?)
    }

    /// Current copy of an object, read synchronously
    pub fn snapshot(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.state().objects.get(&key_of(key)).cloned()
    }

    /// Look an object up by group and kind, ignoring the API version
    pub fn find(&self, group: &str, kind: &str, namespace: &str, name: &str) -> Option<DynamicObject> {
        let key = (
            group.to_string(),
            kind.to_string(),
            namespace.to_string(),
            name.to_string(),
        );
        self.state().objects.get(&key).cloned()
    }

    /// Typed copy of an object, read synchronously
    pub fn typed<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        self.snapshot(&ObjectKey::of::<K>(namespace, name))
            .and_then(|obj| from_dynamic(&obj).ok())
    }

    /// Number of stored objects of a resource
    pub fn count(&self, resource: &ApiResource) -> usize {
        self.state()
            .objects
            .keys()
            .filter(|(group, kind, _, _)| *group == resource.group && *kind == resource.kind)
            .count()
    }

    /// Replace an object's status as another controller would; not recorded as a write
    pub fn set_status(&self, key: &ObjectKey, status: serde_json::Value) -> bool {
        let mut state = self.state();
        let revision = state.next_revision();
        match state.objects.get_mut(&key_of(key)) {
            Some(obj) => {
                set_status_field(obj, Some(status));
                obj.metadata.resource_version = Some(revision);
                true
            }
            None => false,
        }
    }

    /// All writes recorded so far
    pub fn writes(&self) -> Vec<WriteOp> {
        self.state().writes.clone()
    }

    /// Drain the recorded writes
    pub fn take_writes(&self) -> Vec<WriteOp> {
        std::mem::take(&mut self.state().writes)
    }
}

fn set_status_field(obj: &mut DynamicObject, status: Option<serde_json::Value>) {
    if let serde_json::Value::Object(map) = &mut obj.data {
        match status {
            Some(status) => {
                map.insert("status".to_string(), status);
            }
            None => {
                map.remove("status");
            }
        }
    }
}

fn check_revision(stored: &DynamicObject, incoming: &DynamicObject, label: &str) -> Result<(), StoreError> {
    match &incoming.metadata.resource_version {
        Some(rv) if Some(rv) != stored.metadata.resource_version.as_ref() => {
            Err(StoreError::Conflict(label.to_string()))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl ConvergenceClient for InMemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        Ok(self.snapshot(key))
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        Ok(self
            .state()
            .objects
            .iter()
            .filter(|((group, kind, ns, _), _)| {
                *group == resource.group
                    && *kind == resource.kind
                    && namespace.is_none_or(|wanted| wanted == ns.as_str())
            })
            .map(|(_, obj)| obj)
            .filter(|obj| labels_match(obj, label_selector))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let (key, label) = key_of_object(obj)?;
        let mut state = self.state();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(label));
        }
        let mut stored = obj.clone();
        set_status_field(&mut stored, None);
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.metadata.generation = Some(1);
        stored.metadata.resource_version = Some(state.next_revision());
        state.objects.insert(key, stored.clone());
        state.writes.push(WriteOp::Create(label));
        Ok(stored)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let (key, label) = key_of_object(obj)?;
        let mut state = self.state();
        let revision = state.next_revision();
        let stored = state
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(label.clone()))?;
        check_revision(stored, obj, &label)?;

        let mut updated = obj.clone();
        set_status_field(&mut updated, stored.data.get("status").cloned());
        updated.metadata.uid.clone_from(&stored.metadata.uid);
        updated.metadata.generation = Some(stored.metadata.generation.unwrap_or(1) + 1);
        updated.metadata.resource_version = Some(revision);
        state.objects.insert(key, updated.clone());
        state.writes.push(WriteOp::Update(label));
        Ok(updated)
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let (key, label) = key_of_object(obj)?;
        let mut state = self.state();
        let revision = state.next_revision();
        let stored = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(label.clone()))?;
        check_revision(stored, obj, &label)?;

        set_status_field(stored, obj.data.get("status").cloned());
        stored.metadata.resource_version = Some(revision);
        let updated = stored.clone();
        state.writes.push(WriteOp::UpdateStatus(label));
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey, _policy: PropagationPolicy) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.objects.remove(&key_of(key)).is_some() {
            state.writes.push(WriteOp::Delete(key.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn config_map(name: &str) -> DynamicObject {
        to_dynamic(&ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("api".to_string()),
                labels: Some([("app".to_string(), "apimanager".to_string())].into()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_twice_is_already_exists() {
        let store = InMemoryStore::new();
        store.create(&config_map("a")).await.unwrap();
        let err = store.create(&config_map("a")).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = InMemoryStore::new();
        let created = store.create(&config_map("a")).await.unwrap();
        store.update(&created).await.unwrap();
        let err = store.update(&created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_list_filters_by_label_and_namespace() {
        let store = InMemoryStore::new();
        store.create(&config_map("a")).await.unwrap();
        store.create(&config_map("b")).await.unwrap();
        let resource = ApiResource::erase::<ConfigMap>(&());
        assert_eq!(
            store
                .list(&resource, Some("api"), Some("app=apimanager"))
                .await
                .unwrap()
                .len(),
            2
        );
        assert!(store
            .list(&resource, Some("other"), None)
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .list(&resource, None, Some("app=other"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_delete_absent_is_silent() {
        let store = InMemoryStore::new();
        store
            .delete(
                &ObjectKey::of::<ConfigMap>("api", "missing"),
                PropagationPolicy::Foreground,
            )
            .await
            .unwrap();
        assert!(store.writes().is_empty());
    }
}
