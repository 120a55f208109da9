//! Fixtures shared by the reconciler integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use apimanager_operator::config::OperatorConfig;
use apimanager_operator::controller::conditions::FixedClock;
use apimanager_operator::controller::reconciler::Reconciler;
use apimanager_operator::crd::{APIManager, APIManagerSpec};
use apimanager_operator::store::{list_as, InMemoryStore, ObjectKey};
use chrono::TimeZone;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::networking::v1::{Ingress, IngressRule, IngressSpec};
use kube::api::ObjectMeta;
use std::sync::Arc;

pub const NAMESPACE: &str = "api";
pub const OPERATOR_NAMESPACE: &str = "apimanager-system";

pub fn config() -> OperatorConfig {
    OperatorConfig {
        operator_namespace: OPERATOR_NAMESPACE.to_string(),
        ..OperatorConfig::default()
    }
}

pub fn reconciler(store: &Arc<InMemoryStore>, config: OperatorConfig) -> Reconciler {
    let clock = chrono::Utc
        .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .expect("valid timestamp");
    Reconciler::new(store.clone(), Arc::new(config)).with_clock(Arc::new(FixedClock(clock)))
}

pub fn apimanager(name: &str) -> APIManager {
    let mut apimanager = APIManager::new(
        name,
        APIManagerSpec {
            wildcard_domain: "apps.example.com".to_string(),
            ..APIManagerSpec::default()
        },
    );
    apimanager.metadata.namespace = Some(NAMESPACE.to_string());
    apimanager
}

/// Publish the requirements ConfigMap; returns its token
pub fn publish_requirements(store: &InMemoryStore, values: &[(&str, &str)]) -> String {
    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some("apimanager-operator-requirements".to_string()),
            namespace: Some(OPERATOR_NAMESPACE.to_string()),
            ..ObjectMeta::default()
        },
        data: Some(
            values
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        ),
        ..ConfigMap::default()
    };
    store.seed_typed(&config_map).expect("seed requirements");
    store
        .typed::<ConfigMap>(OPERATOR_NAMESPACE, "apimanager-operator-requirements")
        .and_then(|cm| cm.metadata.resource_version)
        .expect("requirements token")
}

/// Act as the cluster: every Deployment becomes available and every default route admitted
pub async fn converge_cluster(store: &InMemoryStore, reconciler: &Reconciler, name: &str) {
    let deployments = list_as::<Deployment>(store, Some(NAMESPACE), None)
        .await
        .expect("list deployments");
    for deployment in deployments {
        let key = ObjectKey::of::<Deployment>(
            NAMESPACE,
            deployment.metadata.name.as_deref().unwrap_or_default(),
        );
        store.set_status(
            &key,
            serde_json::json!({"conditions": [{"type": "Available", "status": "True"}]}),
        );
    }

    let Some(apimanager) = store.typed::<APIManager>(NAMESPACE, name) else {
        return;
    };
    let hosts = reconciler.builder.default_ingress_hosts(&apimanager);
    if hosts.is_empty() || store.typed::<Ingress>(NAMESPACE, "default-routes").is_some() {
        return;
    }
    let mut ingress = Ingress {
        metadata: ObjectMeta {
            name: Some("default-routes".to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(IngressSpec {
            rules: Some(
                hosts
                    .into_iter()
                    .map(|host| IngressRule {
                        host: Some(host),
                        ..IngressRule::default()
                    })
                    .collect(),
            ),
            ..IngressSpec::default()
        }),
        ..Ingress::default()
    };
    ingress.status = Some(
        serde_json::from_value(serde_json::json!({
            "loadBalancer": {"ingress": [{"hostname": "router.apps.example.com"}]}
        }))
        .expect("ingress status"),
    );
    store.seed_typed(&ingress).expect("seed ingress");
}
