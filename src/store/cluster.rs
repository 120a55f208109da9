//! # Kubernetes Store
//!
//! [`ConvergenceClient`] backed by the Kubernetes API server.

use super::{api_resource_of, ConvergenceClient, ObjectKey, PropagationPolicy, StoreError};
use crate::constants::FIELD_MANAGER;
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use tracing::debug;

/// Store talking to the API server through `Api<DynamicObject>`
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PostParams::default()
        }
    }
}

/// Map API status codes onto the store's error taxonomy
fn classify(err: kube::Error, what: String) -> StoreError {
    match err {
        kube::Error::Api(ref ae) if ae.code == 404 => StoreError::NotFound(what),
        kube::Error::Api(ref ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(what)
        }
        kube::Error::Api(ref ae) if ae.code == 409 => StoreError::Conflict(what),
        other => StoreError::Kube(other),
    }
}

fn describe(obj: &DynamicObject) -> String {
    let kind = obj.types.as_ref().map_or("object", |t| t.kind.as_str());
    format!(
        "{kind} {}/{}",
        obj.metadata.namespace.as_deref().unwrap_or_default(),
        obj.metadata.name.as_deref().unwrap_or_default()
    )
}

#[async_trait]
impl ConvergenceClient for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        let api = self.api(&key.resource, key.namespace.as_deref());
        let mut obj = api
            .get_opt(&key.name)
            .await
            .map_err(|e| classify(e, key.to_string()))?;
        // The API omits type metadata on some responses
        if let Some(obj) = obj.as_mut() {
            if obj.types.is_none() {
                obj.types = Some(kube::core::TypeMeta {
                    api_version: key.resource.api_version.clone(),
                    kind: key.resource.kind.clone(),
                });
            }
        }
        Ok(obj)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let api = self.api(resource, namespace);
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = api
            .list(&params)
            .await
            .map_err(|e| classify(e, resource.kind.clone()))?;
        Ok(list
            .items
            .into_iter()
            .map(|mut obj| {
                if obj.types.is_none() {
                    obj.types = Some(kube::core::TypeMeta {
                        api_version: resource.api_version.clone(),
                        kind: resource.kind.clone(),
                    });
                }
                obj
            })
            .collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let resource = api_resource_of(obj)?;
        let api = self.api(&resource, obj.metadata.namespace.as_deref());
        debug!("Creating {}", describe(obj));
        api.create(&Self::post_params(), obj)
            .await
            .map_err(|e| classify(e, describe(obj)))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::for_object(obj)?;
        let api = self.api(&key.resource, key.namespace.as_deref());
        debug!("Updating {key}");
        api.replace(&key.name, &Self::post_params(), obj)
            .await
            .map_err(|e| classify(e, key.to_string()))
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::for_object(obj)?;
        let api = self.api(&key.resource, key.namespace.as_deref());
        // A merge patch carrying resourceVersion is rejected with 409 when stale
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.metadata.resource_version },
            "status": obj.data.get("status"),
        });
        debug!("Updating status of {key}");
        api.patch_status(
            &key.name,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..PatchParams::default()
            },
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| classify(e, key.to_string()))
    }

    async fn delete(&self, key: &ObjectKey, policy: PropagationPolicy) -> Result<(), StoreError> {
        let api = self.api(&key.resource, key.namespace.as_deref());
        let params = match policy {
            PropagationPolicy::Foreground => DeleteParams::foreground(),
            PropagationPolicy::Background => DeleteParams::background(),
            PropagationPolicy::Orphan => DeleteParams::orphan(),
        };
        debug!("Deleting {key} ({policy:?})");
        match api.delete(&key.name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(classify(e, key.to_string())),
        }
    }
}
