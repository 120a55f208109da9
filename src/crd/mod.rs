//! # Custom Resource Definitions
//!
//! CRD types for the API Manager operator.
//!
//! This module contains the managed `APIManager` resource, the backup and restore
//! resources driven by the job orchestrator, and the subset of Operator Lifecycle Manager
//! types read by the upgrade gate.

mod backup;
pub mod olm;
mod restore;
mod status;

pub use backup::*;
pub use restore::*;
pub use status::*;

use crate::constants::{OPERATOR_VERSION_ANNOTATION, RELEASE_VERSION_ANNOTATION};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// APIManager Custom Resource Definition
///
/// Describes one installation of the API management platform: the gateway (staging and
/// production), the backend, the core system app and the integration service.
///
/// # Example
///
/// ```yaml
/// apiVersion: apps.apimanager.dev/v1alpha1
/// kind: APIManager
/// metadata:
///   name: apimanager
///   namespace: api
/// spec:
///   wildcardDomain: apps.example.com
///   externalComponents:
///     systemDatabase:
///       enabled: true
///       engine: postgresql
///       version: "13.4"
/// ```
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "APIManager",
    group = "apps.apimanager.dev",
    version = "v1alpha1",
    namespaced,
    status = "APIManagerStatus",
    shortname = "apim",
    printcolumn = r#"{"name":"Available", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Available\")].status"}, {"name":"Preflights", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Preflights\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct APIManagerSpec {
    /// Root domain under which tenant routes are exposed
    pub wildcard_domain: String,
    /// Value of the `app` label set on every owned resource
    #[serde(default)]
    pub app_label: Option<String>,
    /// Name of the default tenant
    #[serde(default)]
    pub tenant_name: Option<String>,
    /// Whether components carry resource requests and limits
    #[serde(default)]
    pub resource_requirements_enabled: Option<bool>,
    #[serde(default)]
    pub apicast: Option<ApicastSpec>,
    #[serde(default)]
    pub backend: Option<BackendSpec>,
    #[serde(default)]
    pub system: Option<SystemSpec>,
    #[serde(default)]
    pub zync: Option<ZyncSpec>,
    /// Databases and caches managed outside of the operator
    #[serde(default)]
    pub external_components: Option<ExternalComponentsSpec>,
}

/// Gateway configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApicastSpec {
    /// Management API exposure: disabled, status or debug
    #[serde(default)]
    pub management_api: Option<String>,
    #[serde(default)]
    pub open_ssl_verify: Option<bool>,
    #[serde(default)]
    pub include_response_codes: Option<bool>,
    #[serde(default)]
    pub staging_spec: Option<ApicastEnvironmentSpec>,
    #[serde(default)]
    pub production_spec: Option<ApicastEnvironmentSpec>,
}

/// Settings of one gateway environment
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApicastEnvironmentSpec {
    #[serde(default)]
    pub replicas: Option<i32>,
    /// HorizontalPodAutoscaler enabled; overrides `replicas`
    #[serde(default)]
    pub hpa: bool,
    #[serde(default)]
    pub http_port: Option<i32>,
    #[serde(default)]
    pub https_port: Option<i32>,
    /// Deprecated tracing integration
    #[serde(default)]
    pub open_tracing: Option<OpenTracingSpec>,
    #[serde(default)]
    pub open_telemetry: Option<OpenTelemetrySpec>,
    #[serde(default)]
    pub custom_environments: Vec<CustomEnvironmentSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpenTracingSpec {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub tracing_library: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpenTelemetrySpec {
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomEnvironmentSpec {
    /// Secret holding the environment customisation
    #[serde(default)]
    pub secret_ref: Option<LocalObjectReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    pub name: String,
}

/// Backend configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    #[serde(default)]
    pub listener_spec: Option<ScalableComponentSpec>,
    #[serde(default)]
    pub worker_spec: Option<ScalableComponentSpec>,
    #[serde(default)]
    pub cron_spec: Option<ScalableComponentSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScalableComponentSpec {
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub hpa: bool,
}

/// Core system app configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemSpec {
    #[serde(default)]
    pub file_storage: Option<SystemFileStorageSpec>,
    #[serde(default)]
    pub app_replicas: Option<i32>,
    #[serde(default)]
    pub sidekiq_replicas: Option<i32>,
}

/// Where the system app keeps uploaded files; exactly one backend may be set
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemFileStorageSpec {
    #[serde(default)]
    pub persistent_volume_claim: Option<SystemPvcSpec>,
    #[serde(default)]
    pub simple_storage_service: Option<SystemS3Spec>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemPvcSpec {
    #[serde(default)]
    pub storage_class_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemS3Spec {
    pub configuration_secret_ref: LocalObjectReference,
}

/// Integration service configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZyncSpec {
    #[serde(default)]
    pub app_replicas: Option<i32>,
    #[serde(default)]
    pub que_replicas: Option<i32>,
}

/// Components provided outside the operator's ownership
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalComponentsSpec {
    #[serde(default)]
    pub system_database: Option<ExternalDatabaseSpec>,
    #[serde(default)]
    pub system_redis: Option<ExternalComponentSpec>,
    #[serde(default)]
    pub backend_redis: Option<ExternalComponentSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalComponentSpec {
    #[serde(default)]
    pub enabled: bool,
    /// Version reported by the component's administrator
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalDatabaseSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub engine: DatabaseEngine,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    #[default]
    Mysql,
    Postgresql,
}

/// Gateway environments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApicastEnvironment {
    Staging,
    Production,
}

impl ApicastEnvironment {
    pub const ALL: [Self; 2] = [Self::Staging, Self::Production];

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Staging => "Apicast Staging",
            Self::Production => "Apicast Production",
        }
    }
}

impl APIManager {
    pub fn app_label(&self) -> &str {
        self.spec.app_label.as_deref().unwrap_or("apimanager")
    }

    pub fn tenant_name(&self) -> &str {
        self.spec.tenant_name.as_deref().unwrap_or("3scale")
    }

    pub fn resource_requirements_enabled(&self) -> bool {
        self.spec.resource_requirements_enabled.unwrap_or(true)
    }

    pub fn apicast_environment(&self, env: ApicastEnvironment) -> Option<&ApicastEnvironmentSpec> {
        let apicast = self.spec.apicast.as_ref()?;
        match env {
            ApicastEnvironment::Staging => apicast.staging_spec.as_ref(),
            ApicastEnvironment::Production => apicast.production_spec.as_ref(),
        }
    }

    /// True when any scalable component delegates its replica count to an autoscaler
    pub fn hpa_enabled(&self) -> bool {
        let gateway = ApicastEnvironment::ALL
            .iter()
            .filter_map(|env| self.apicast_environment(*env))
            .any(|spec| spec.hpa);
        let backend = self.spec.backend.as_ref().is_some_and(|backend| {
            [&backend.listener_spec, &backend.worker_spec, &backend.cron_spec]
                .into_iter()
                .flatten()
                .any(|spec| spec.hpa)
        });
        gateway || backend
    }

    pub fn open_tracing_enabled(&self, env: ApicastEnvironment) -> bool {
        self.apicast_environment(env)
            .and_then(|spec| spec.open_tracing.as_ref())
            .and_then(|tracing| tracing.enabled)
            .unwrap_or(false)
    }

    pub fn system_file_storage(&self) -> Option<&SystemFileStorageSpec> {
        self.spec.system.as_ref()?.file_storage.as_ref()
    }

    /// True when uploaded files live on a claim owned by the installation
    pub fn system_storage_is_pvc(&self) -> bool {
        self.system_file_storage()
            .is_some_and(|storage| storage.persistent_volume_claim.is_some())
    }

    pub fn external_components(&self) -> ExternalComponentsSpec {
        self.spec.external_components.clone().unwrap_or_default()
    }

    pub fn operator_version_annotation(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()?
            .get(OPERATOR_VERSION_ANNOTATION)
            .map(String::as_str)
    }

    pub fn release_version_annotation(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()?
            .get(RELEASE_VERSION_ANNOTATION)
            .map(String::as_str)
    }

    /// A fresh installation has never been stamped with a release
    pub fn is_fresh_install(&self) -> bool {
        self.release_version_annotation().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apimanager(spec: serde_json::Value) -> APIManager {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "apps.apimanager.dev/v1alpha1",
            "kind": "APIManager",
            "metadata": {"name": "apimanager", "namespace": "api"},
            "spec": spec,
        }))
        .unwrap()
    }

    #[test]
    fn test_hpa_detected_on_backend() {
        let cr = apimanager(serde_json::json!({
            "wildcardDomain": "example.com",
            "backend": {"workerSpec": {"hpa": true}},
        }));
        assert!(cr.hpa_enabled());
    }

    #[test]
    fn test_open_tracing_per_environment() {
        let cr = apimanager(serde_json::json!({
            "wildcardDomain": "example.com",
            "apicast": {"productionSpec": {"openTracing": {"enabled": true}}},
        }));
        assert!(cr.open_tracing_enabled(ApicastEnvironment::Production));
        assert!(!cr.open_tracing_enabled(ApicastEnvironment::Staging));
    }

    #[test]
    fn test_external_database_engine_parses_lowercase() {
        let cr = apimanager(serde_json::json!({
            "wildcardDomain": "example.com",
            "externalComponents": {"systemDatabase": {"enabled": true, "engine": "postgresql", "version": "13.4"}},
        }));
        let db = cr.external_components().system_database.unwrap();
        assert_eq!(db.engine, DatabaseEngine::Postgresql);
        assert_eq!(db.version.as_deref(), Some("13.4"));
    }
}
