//! # Object Builder
//!
//! Turns an APIManager into the desired objects of each component.
//!
//! The driver only depends on [`ObjectBuilder`]. [`DefaultObjectBuilder`] renders one
//! Deployment per workload, a Service for workloads listening on a port, the optional
//! autoscaler and the system file storage claim.

use crate::controller::error::BuildError;
use crate::crd::{APIManager, ApicastEnvironment, DatabaseEngine};
use crate::store::{to_dynamic, Desired, Mutator, ObjectKey, PropagationPolicy, StoreError};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, ResourceRequirements, Service, ServicePort, ServiceSpec,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::Resource;
use std::collections::BTreeMap;

/// Name of the claim holding the system app's uploaded files
pub const SYSTEM_STORAGE_PVC: &str = "system-storage";

const COMPONENT_LABEL: &str = "apps.apimanager.dev/component";
const SELECTOR_LABEL: &str = "deployment";
const HPA_MAX_REPLICAS: i32 = 5;

/// Desired objects of one component, reconciled by one step
#[derive(Debug, Clone)]
pub struct ComponentPlan {
    pub name: &'static str,
    pub objects: Vec<Desired>,
    /// Deployments that must be available for the APIManager to be available
    pub deployments: Vec<String>,
}

/// Produces desired objects for an APIManager
pub trait ObjectBuilder: Send + Sync {
    fn components(&self, apimanager: &APIManager) -> Result<Vec<ComponentPlan>, BuildError>;

    /// Hosts the integration service must expose before the installation is usable
    fn default_ingress_hosts(&self, apimanager: &APIManager) -> Vec<String>;
}

/// One long-running workload of a component
#[derive(Debug, Clone)]
struct Workload {
    name: &'static str,
    image: &'static str,
    replicas: Option<i32>,
    port: Option<i32>,
    /// `Some` for workloads that support autoscaling
    hpa: Option<bool>,
}

impl Workload {
    fn new(name: &'static str, image: &'static str) -> Self {
        Self {
            name,
            image,
            replicas: Some(1),
            port: None,
            hpa: None,
        }
    }

    fn port(mut self, port: i32) -> Self {
        self.port = Some(port);
        self
    }

    fn replicas(mut self, replicas: Option<i32>) -> Self {
        self.replicas = Some(replicas.unwrap_or(1));
        self
    }

    fn autoscaled(mut self, enabled: bool) -> Self {
        self.hpa = Some(enabled);
        if enabled {
            self.replicas = None;
        }
        self
    }
}

/// Minimal renderer; one Deployment (plus Service) per workload
#[derive(Debug, Clone)]
pub struct DefaultObjectBuilder {
    release_version: String,
    registry: String,
}

impl DefaultObjectBuilder {
    pub fn new(release_version: &str) -> Self {
        Self {
            release_version: release_version.to_string(),
            registry: "quay.io/apimanager".to_string(),
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: &str) -> Self {
        self.registry = registry.to_string();
        self
    }

    fn workloads(apimanager: &APIManager) -> Vec<(&'static str, Vec<Workload>)> {
        let mut components = Vec::new();

        for env in ApicastEnvironment::ALL {
            let spec = apimanager.apicast_environment(env).cloned().unwrap_or_default();
            let (component, name) = match env {
                ApicastEnvironment::Staging => ("apicast-staging", "apicast-staging"),
                ApicastEnvironment::Production => ("apicast-production", "apicast-production"),
            };
            components.push((
                component,
                vec![Workload::new(name, "apicast")
                    .port(spec.http_port.unwrap_or(8080))
                    .replicas(spec.replicas)
                    .autoscaled(spec.hpa)],
            ));
        }

        let backend = apimanager.spec.backend.clone().unwrap_or_default();
        let listener = backend.listener_spec.unwrap_or_default();
        let worker = backend.worker_spec.unwrap_or_default();
        let cron = backend.cron_spec.unwrap_or_default();
        components.push((
            "backend",
            vec![
                Workload::new("backend-listener", "backend")
                    .port(3000)
                    .replicas(listener.replicas)
                    .autoscaled(listener.hpa),
                Workload::new("backend-worker", "backend")
                    .replicas(worker.replicas)
                    .autoscaled(worker.hpa),
                Workload::new("backend-cron", "backend").replicas(cron.replicas),
            ],
        ));

        let system = apimanager.spec.system.clone().unwrap_or_default();
        components.push((
            "system",
            vec![
                Workload::new("system-app", "system")
                    .port(3000)
                    .replicas(system.app_replicas),
                Workload::new("system-sidekiq", "system").replicas(system.sidekiq_replicas),
                Workload::new("system-memcache", "memcached").port(11211),
                Workload::new("system-searchd", "searchd").port(9306),
            ],
        ));

        let zync = apimanager.spec.zync.clone().unwrap_or_default();
        components.push((
            "zync",
            vec![
                Workload::new("zync", "zync")
                    .port(8080)
                    .replicas(zync.app_replicas),
                Workload::new(crate::constants::ZYNC_QUE_DEPLOYMENT, "zync")
                    .replicas(zync.que_replicas),
            ],
        ));

        let external = apimanager.external_components();
        if !external.backend_redis.as_ref().is_some_and(|c| c.enabled) {
            components.push((
                "backend-redis",
                vec![Workload::new("backend-redis", "redis").port(6379)],
            ));
        }
        if !external.system_redis.as_ref().is_some_and(|c| c.enabled) {
            components.push((
                "system-redis",
                vec![Workload::new("system-redis", "redis").port(6379)],
            ));
        }
        match external.system_database {
            Some(db) if db.enabled => {}
            Some(db) if db.engine == DatabaseEngine::Postgresql => components.push((
                "system-database",
                vec![Workload::new("system-postgresql", "postgresql").port(5432)],
            )),
            _ => components.push((
                "system-database",
                vec![Workload::new("system-mysql", "mysql").port(3306)],
            )),
        }

        components
    }

    fn meta(
        apimanager: &APIManager,
        owner: &OwnerReference,
        component: &str,
        name: &str,
    ) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: apimanager.metadata.namespace.clone(),
            labels: Some(
                [
                    ("app".to_string(), apimanager.app_label().to_string()),
                    (COMPONENT_LABEL.to_string(), component.to_string()),
                ]
                .into(),
            ),
            owner_references: Some(vec![owner.clone()]),
            ..ObjectMeta::default()
        }
    }

    fn deployment(
        &self,
        apimanager: &APIManager,
        owner: &OwnerReference,
        component: &str,
        workload: &Workload,
    ) -> Result<Desired, StoreError> {
        let selector: BTreeMap<String, String> =
            [(SELECTOR_LABEL.to_string(), workload.name.to_string())].into();
        let resources = apimanager
            .resource_requirements_enabled()
            .then(|| ResourceRequirements {
                requests: Some(
                    [
                        ("cpu".to_string(), Quantity("50m".to_string())),
                        ("memory".to_string(), Quantity("64Mi".to_string())),
                    ]
                    .into(),
                ),
                ..ResourceRequirements::default()
            });
        let deployment = Deployment {
            metadata: Self::meta(apimanager, owner, component, workload.name),
            spec: Some(DeploymentSpec {
                replicas: workload.replicas,
                selector: LabelSelector {
                    match_labels: Some(selector.clone()),
                    ..LabelSelector::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(selector),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: workload.name.to_string(),
                            image: Some(format!(
                                "{}/{}:{}",
                                self.registry, workload.image, self.release_version
                            )),
                            ports: workload.port.map(|port| {
                                vec![ContainerPort {
                                    container_port: port,
                                    ..ContainerPort::default()
                                }]
                            }),
                            resources,
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    }),
                },
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        };
        Ok(Desired::merged(to_dynamic(&deployment)?, Mutator::MERGE_SPEC))
    }

    fn service(
        apimanager: &APIManager,
        owner: &OwnerReference,
        component: &str,
        workload: &Workload,
        port: i32,
    ) -> Result<Desired, StoreError> {
        let service = Service {
            metadata: Self::meta(apimanager, owner, component, workload.name),
            spec: Some(ServiceSpec {
                selector: Some([(SELECTOR_LABEL.to_string(), workload.name.to_string())].into()),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        };
        Ok(Desired::merged(to_dynamic(&service)?, Mutator::MERGE_SPEC))
    }

    fn autoscaler(
        apimanager: &APIManager,
        owner: &OwnerReference,
        component: &str,
        workload: &Workload,
        enabled: bool,
    ) -> Result<Desired, StoreError> {
        if !enabled {
            return Ok(Desired::Absent {
                key: ObjectKey::of::<HorizontalPodAutoscaler>(
                    apimanager.metadata.namespace.as_deref().unwrap_or_default(),
                    workload.name,
                ),
                policy: PropagationPolicy::Background,
            });
        }
        let hpa = HorizontalPodAutoscaler {
            metadata: Self::meta(apimanager, owner, component, workload.name),
            spec: Some(HorizontalPodAutoscalerSpec {
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some("apps/v1".to_string()),
                    kind: "Deployment".to_string(),
                    name: workload.name.to_string(),
                },
                min_replicas: Some(1),
                max_replicas: HPA_MAX_REPLICAS,
                ..HorizontalPodAutoscalerSpec::default()
            }),
            ..HorizontalPodAutoscaler::default()
        };
        Ok(Desired::merged(to_dynamic(&hpa)?, Mutator::MERGE_SPEC))
    }

    fn system_storage_claim(
        apimanager: &APIManager,
        owner: &OwnerReference,
    ) -> Result<Desired, StoreError> {
        let storage_class = apimanager
            .system_file_storage()
            .and_then(|storage| storage.persistent_volume_claim.as_ref())
            .and_then(|pvc| pvc.storage_class_name.clone());
        let claim = PersistentVolumeClaim {
            metadata: Self::meta(apimanager, owner, "system", SYSTEM_STORAGE_PVC),
            spec: Some(system_storage_claim_spec(storage_class)),
            ..PersistentVolumeClaim::default()
        };
        Ok(Desired::create_only(to_dynamic(&claim)?))
    }
}

/// Spec of the system file storage claim; shared with the restore flow
pub fn system_storage_claim_spec(storage_class: Option<String>) -> PersistentVolumeClaimSpec {
    PersistentVolumeClaimSpec {
        access_modes: Some(vec!["ReadWriteMany".to_string()]),
        storage_class_name: storage_class,
        resources: Some(VolumeResourceRequirements {
            requests: Some([("storage".to_string(), Quantity("100Mi".to_string()))].into()),
            ..VolumeResourceRequirements::default()
        }),
        ..PersistentVolumeClaimSpec::default()
    }
}

impl ObjectBuilder for DefaultObjectBuilder {
    fn components(&self, apimanager: &APIManager) -> Result<Vec<ComponentPlan>, BuildError> {
        if apimanager.spec.wildcard_domain.trim().is_empty() {
            return Err(BuildError::Invalid {
                component: "apimanager".to_string(),
                message: "wildcardDomain must not be empty".to_string(),
            });
        }
        let owner = apimanager
            .controller_owner_ref(&())
            .ok_or(StoreError::Incomplete("metadata.uid"))?;

        let mut plans = Vec::new();
        for (component, workloads) in Self::workloads(apimanager) {
            let mut objects = Vec::new();
            for workload in &workloads {
                objects.push(self.deployment(apimanager, &owner, component, workload)?);
                if let Some(port) = workload.port {
                    objects.push(Self::service(apimanager, &owner, component, workload, port)?);
                }
                if let Some(enabled) = workload.hpa {
                    objects.push(Self::autoscaler(
                        apimanager, &owner, component, workload, enabled,
                    )?);
                }
            }
            if component == "system" && apimanager.system_storage_is_pvc() {
                objects.push(Self::system_storage_claim(apimanager, &owner)?);
            }
            plans.push(ComponentPlan {
                name: component,
                objects,
                deployments: workloads.iter().map(|w| w.name.to_string()).collect(),
            });
        }
        Ok(plans)
    }

    fn default_ingress_hosts(&self, apimanager: &APIManager) -> Vec<String> {
        let tenant = apimanager.tenant_name();
        let domain = &apimanager.spec.wildcard_domain;
        vec![
            format!("backend-{tenant}.{domain}"),
            format!("master.{domain}"),
            format!("{tenant}-admin.{domain}"),
            format!("{tenant}.{domain}"),
            format!("api-{tenant}-apicast-staging.{domain}"),
            format!("api-{tenant}-apicast-production.{domain}"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apimanager(spec: serde_json::Value) -> APIManager {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "apps.apimanager.dev/v1alpha1",
            "kind": "APIManager",
            "metadata": {"name": "apimanager", "namespace": "api", "uid": "uid-1"},
            "spec": spec,
        }))
        .unwrap()
    }

    fn names(plans: &[ComponentPlan]) -> Vec<&'static str> {
        plans.iter().map(|p| p.name).collect()
    }

    #[test]
    fn test_external_components_are_not_rendered() {
        let builder = DefaultObjectBuilder::new("2.15.0");
        let internal = builder
            .components(&apimanager(serde_json::json!({"wildcardDomain": "example.com"})))
            .unwrap();
        assert!(names(&internal).contains(&"system-database"));

        let external = builder
            .components(&apimanager(serde_json::json!({
                "wildcardDomain": "example.com",
                "externalComponents": {
                    "systemDatabase": {"enabled": true},
                    "systemRedis": {"enabled": true},
                    "backendRedis": {"enabled": true},
                },
            })))
            .unwrap();
        let external_names = names(&external);
        assert!(!external_names.contains(&"system-database"));
        assert!(!external_names.contains(&"backend-redis"));
    }

    #[test]
    fn test_objects_are_owned_by_the_apimanager() {
        let builder = DefaultObjectBuilder::new("2.15.0");
        let plans = builder
            .components(&apimanager(serde_json::json!({"wildcardDomain": "example.com"})))
            .unwrap();
        for desired in plans.iter().flat_map(|p| &p.objects) {
            if let Desired::Present { object, .. } = desired {
                let owners = object.metadata.owner_references.as_ref().unwrap();
                assert_eq!(owners[0].uid, "uid-1");
                assert_eq!(owners[0].controller, Some(true));
            }
        }
    }

    #[test]
    fn test_missing_uid_is_an_error() {
        let mut cr = apimanager(serde_json::json!({"wildcardDomain": "example.com"}));
        cr.metadata.uid = None;
        assert!(DefaultObjectBuilder::new("2.15.0").components(&cr).is_err());
    }

    #[test]
    fn test_autoscaler_toggles_between_present_and_absent() {
        let builder = DefaultObjectBuilder::new("2.15.0");
        let plans = builder
            .components(&apimanager(serde_json::json!({
                "wildcardDomain": "example.com",
                "apicast": {"productionSpec": {"hpa": true}},
            })))
            .unwrap();
        let hpa_entries = |component: &str| -> Vec<bool> {
            plans
                .iter()
                .find(|p| p.name == component)
                .unwrap()
                .objects
                .iter()
                .filter_map(|d| match d {
                    Desired::Present { object, .. } => object
                        .types
                        .as_ref()
                        .filter(|t| t.kind == "HorizontalPodAutoscaler")
                        .map(|_| true),
                    Desired::Absent { key, .. } => {
                        (key.resource.kind == "HorizontalPodAutoscaler").then_some(false)
                    }
                })
                .collect()
        };
        assert_eq!(hpa_entries("apicast-production"), vec![true]);
        assert_eq!(hpa_entries("apicast-staging"), vec![false]);
    }

    #[test]
    fn test_default_ingress_hosts_use_tenant() {
        let cr = apimanager(serde_json::json!({"wildcardDomain": "example.com", "tenantName": "acme"}));
        let hosts = DefaultObjectBuilder::new("2.15.0").default_ingress_hosts(&cr);
        assert!(hosts.contains(&"acme-admin.example.com".to_string()));
        assert!(hosts.contains(&"master.example.com".to_string()));
    }
}
