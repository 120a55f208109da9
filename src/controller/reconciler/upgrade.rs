//! # Upgrade Procedure
//!
//! Migrations run once when an APIManager was last reconciled by a different operator version.
//! Every migration is idempotent: re-running it after a crash only repeats no-op deletes.

use crate::controller::error::ReconcilerError;
use crate::crd::APIManager;
use crate::store::{ensure, ConvergenceClient, Desired, ObjectKey, PropagationPolicy};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::core::ApiResource;
use tracing::info;

/// Pluggable migration list run before the spec phase
#[async_trait]
pub trait UpgradeProcedure: Send + Sync {
    async fn run(
        &self,
        client: &dyn ConvergenceClient,
        apimanager: &APIManager,
        from_version: &str,
        to_version: &str,
    ) -> Result<(), ReconcilerError>;
}

/// One object left behind by an older operator version
#[derive(Debug, Clone)]
pub struct LegacyObject {
    pub resource: ApiResource,
    pub name: &'static str,
}

impl LegacyObject {
    fn of<K: kube::Resource<DynamicType = ()>>(name: &'static str) -> Self {
        Self {
            resource: ApiResource::erase::<K>(&()),
            name,
        }
    }
}

/// Removes objects that later versions no longer own
#[derive(Debug, Clone)]
pub struct DefaultUpgradeProcedure {
    pub legacy: Vec<LegacyObject>,
}

impl Default for DefaultUpgradeProcedure {
    fn default() -> Self {
        Self {
            legacy: vec![
                // Search was renamed to system-searchd
                LegacyObject::of::<Deployment>("system-sphinx"),
                LegacyObject::of::<Service>("system-sphinx"),
                // Redis settings moved into the redis deployments' environment
                LegacyObject::of::<ConfigMap>("redis-config"),
            ],
        }
    }
}

#[async_trait]
impl UpgradeProcedure for DefaultUpgradeProcedure {
    async fn run(
        &self,
        client: &dyn ConvergenceClient,
        apimanager: &APIManager,
        from_version: &str,
        to_version: &str,
    ) -> Result<(), ReconcilerError> {
        let namespace = apimanager
            .metadata
            .namespace
            .as_deref()
            .ok_or(ReconcilerError::MissingObjectKey("metadata.namespace"))?;
        info!("⬆️ Upgrading from operator {from_version} to {to_version}");
        for legacy in &self.legacy {
            ensure(
                client,
                Desired::Absent {
                    key: ObjectKey::new(legacy.resource.clone(), Some(namespace), legacy.name),
                    policy: PropagationPolicy::Background,
                },
            )
            .await?;
        }
        Ok(())
    }
}
