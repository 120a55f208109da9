//! # Status Management
//!
//! Recomputes the APIManager status from what is observed in the namespace.
//!
//! The status pass always runs, even after a failed spec phase. It persists only when the
//! computed status differs from the stored one, so a converged installation costs no writes.

use super::preflights::PreflightReport;
use super::types::Reconciler;
use crate::constants::*;
use crate::controller::conditions::{canonical_json, Clock, ConditionLedger, WarningEvaluation, WarningRule};
use crate::controller::error::ReconcilerError;
use crate::controller::steps::ReconcileSignal;
use crate::crd::{APIManager, APIManagerStatus, ApicastEnvironment, Condition, ConditionStatus, DeploymentStatus};
use crate::observability;
use crate::store::{get_as, list_as, update_status_as, ConvergenceClient, StoreError};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info};

/// What the status pass saw in the namespace
#[derive(Debug, Clone, Default)]
pub struct Observed {
    /// Deployments owned by the APIManager
    pub deployments: Vec<Deployment>,
    /// Deployments the installation needs
    pub expected: Vec<String>,
    pub routes_ready: bool,
    pub missing_secrets: Vec<String>,
}

pub fn hpa_rule() -> WarningRule {
    WarningRule::new(
        CONDITION_WARNING,
        "HPA",
        "HorizontalPodAutoscaling (Hpa) enabled overrides values applied to replicas",
    )
}

pub fn open_tracing_rule(env: ApicastEnvironment) -> WarningRule {
    WarningRule::new(
        CONDITION_WARNING,
        format!("{} OpenTracing Deprecation", env.display_name()),
        "OpenTracing is deprecated, please use OpenTelemetry instead",
    )
}

fn warnings(apimanager: &APIManager) -> Vec<WarningEvaluation> {
    let mut evaluations = vec![WarningEvaluation {
        rule: hpa_rule(),
        applies: apimanager.hpa_enabled() && !apimanager.resource_requirements_enabled(),
    }];
    for env in ApicastEnvironment::ALL {
        evaluations.push(WarningEvaluation {
            rule: open_tracing_rule(env),
            applies: apimanager.open_tracing_enabled(env),
        });
    }
    evaluations
}

fn deployment_available(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == CONDITION_AVAILABLE && c.status == "True")
        })
}

/// Sort owned deployments into ready, starting and stopped
pub fn deployment_rollup(deployments: &[Deployment]) -> DeploymentStatus {
    let mut rollup = DeploymentStatus::default();
    for deployment in deployments {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        if replicas == 0 {
            rollup.stopped.push(name);
        } else if deployment_available(deployment) {
            rollup.ready.push(name);
        } else {
            rollup.starting.push(name);
        }
    }
    rollup.ready.sort();
    rollup.starting.sort();
    rollup.stopped.sort();
    rollup
}

fn available_condition(observed: &Observed) -> Condition {
    if !observed.missing_secrets.is_empty() {
        return Condition::new(
            CONDITION_AVAILABLE,
            ConditionStatus::False,
            REASON_MISSING_WATCHED_SECRETS,
            format!(
                "The following secret(s) could not be found: {}",
                observed.missing_secrets.join(", ")
            ),
        );
    }
    let ready: BTreeSet<&str> = observed
        .deployments
        .iter()
        .filter(|d| deployment_available(d))
        .filter_map(|d| d.metadata.name.as_deref())
        .collect();
    let not_ready: Vec<&str> = observed
        .expected
        .iter()
        .map(String::as_str)
        .filter(|name| !ready.contains(name))
        .collect();
    if !not_ready.is_empty() {
        return Condition::new(
            CONDITION_AVAILABLE,
            ConditionStatus::False,
            REASON_DEPLOYMENTS_NOT_READY,
            format!("Waiting for deployments: {}", not_ready.join(", ")),
        );
    }
    if !observed.routes_ready {
        return Condition::new(
            CONDITION_AVAILABLE,
            ConditionStatus::False,
            REASON_ROUTES_NOT_READY,
            "Default routes are not admitted yet",
        );
    }
    Condition::new(CONDITION_AVAILABLE, ConditionStatus::True, REASON_DEPLOYMENTS_READY, "")
}

/// Next status of `apimanager`; pure apart from the clock
pub fn compute_status(
    apimanager: &APIManager,
    observed: &Observed,
    preflight: Option<&PreflightReport>,
    clock: &dyn Clock,
) -> APIManagerStatus {
    let existing = apimanager.status.clone().unwrap_or_default();

    let mut primary = vec![available_condition(observed)];
    primary.extend(preflight.and_then(PreflightReport::to_condition));

    // Warnings are only re-evaluated once preflights let the installation proceed
    let blocked = matches!(
        preflight,
        Some(
            PreflightReport::Failed { .. }
                | PreflightReport::Pending
                | PreflightReport::MultiMinor { .. }
        )
    );
    let warnings = if blocked { Vec::new() } else { warnings(apimanager) };

    APIManagerStatus {
        conditions: ConditionLedger::evaluate(&existing.conditions, primary, &warnings, clock),
        deployments: deployment_rollup(&observed.deployments),
        confirmed_requirements_version: existing.confirmed_requirements_version,
    }
}

/// True when two statuses serialize identically
pub fn status_equal(a: &APIManagerStatus, b: &APIManagerStatus) -> Result<bool, serde_json::Error> {
    Ok(canonical_json(&a.conditions)? == canonical_json(&b.conditions)?
        && a.deployments == b.deployments
        && a.confirmed_requirements_version == b.confirmed_requirements_version)
}

/// Secrets the installation reads and that must exist before it is usable
fn watched_secrets(apimanager: &APIManager) -> Vec<String> {
    let mut names = BTreeSet::new();
    if let Some(s3) = apimanager
        .system_file_storage()
        .and_then(|storage| storage.simple_storage_service.as_ref())
    {
        names.insert(s3.configuration_secret_ref.name.clone());
    }
    for env in ApicastEnvironment::ALL {
        for custom in apimanager
            .apicast_environment(env)
            .map(|spec| spec.custom_environments.as_slice())
            .unwrap_or_default()
        {
            if let Some(secret) = &custom.secret_ref {
                names.insert(secret.name.clone());
            }
        }
    }
    names.into_iter().collect()
}

fn ingress_admits(ingress: &Ingress, host: &str) -> bool {
    let has_rule = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.rules.as_ref())
        .is_some_and(|rules| rules.iter().any(|r| r.host.as_deref() == Some(host)));
    let admitted = ingress
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .is_some_and(|entries| !entries.is_empty());
    has_rule && admitted
}

/// Gather the observations for one status pass
pub async fn observe(
    reconciler: &Reconciler,
    apimanager: &APIManager,
    namespace: &str,
) -> Result<Observed, ReconcilerError> {
    let client: &dyn ConvergenceClient = reconciler.client.as_ref();
    let uid = apimanager
        .metadata
        .uid
        .as_deref()
        .ok_or(ReconcilerError::MissingObjectKey("metadata.uid"))?;

    let mut deployments: Vec<Deployment> = list_as::<Deployment>(client, Some(namespace), None)
        .await?
        .into_iter()
        .filter(|d| {
            d.metadata
                .owner_references
                .iter()
                .flatten()
                .any(|owner| owner.uid == uid)
        })
        .collect();
    deployments.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

    let expected = match reconciler.builder.components(apimanager) {
        Ok(plans) => plans.into_iter().flat_map(|plan| plan.deployments).collect(),
        // An unbuildable spec has nothing to wait for; the spec phase reports the error
        Err(e) => {
            debug!("No expected deployments: {e}");
            Vec::new()
        }
    };

    let ingresses = list_as::<Ingress>(client, Some(namespace), None).await?;
    let routes_ready = reconciler
        .builder
        .default_ingress_hosts(apimanager)
        .iter()
        .all(|host| ingresses.iter().any(|ingress| ingress_admits(ingress, host)));

    let mut missing_secrets = Vec::new();
    for name in watched_secrets(apimanager) {
        if get_as::<Secret>(client, namespace, &name).await?.is_none() {
            missing_secrets.push(name);
        }
    }

    Ok(Observed {
        deployments,
        expected,
        routes_ready,
        missing_secrets,
    })
}

/// Recompute and persist status; requeues until the installation is available
pub async fn reconcile_status(
    reconciler: &Reconciler,
    namespace: &str,
    name: &str,
    preflight: Option<&PreflightReport>,
) -> Result<ReconcileSignal, ReconcilerError> {
    // Reload: the spec phase may have written annotations or the confirmation
    let Some(apimanager) = get_as::<APIManager>(reconciler.client.as_ref(), namespace, name).await?
    else {
        return Ok(ReconcileSignal::done());
    };

    let observed = observe(reconciler, &apimanager, namespace).await?;
    let next = compute_status(&apimanager, &observed, preflight, reconciler.clock.as_ref());
    let available = next.is_available();
    let existing = apimanager.status.clone().unwrap_or_default();

    if status_equal(&existing, &next)? {
        debug!("Status unchanged");
    } else {
        let mut updated = apimanager.clone();
        updated.status = Some(next);
        match update_status_as(reconciler.client.as_ref(), &updated).await {
            Ok(_) => {
                info!(available, "🔄 Updated status of APIManager {namespace}/{name}");
                observability::metrics::increment_status_writes_total("apimanager");
            }
            Err(StoreError::Conflict(_)) => {
                debug!("Status write conflicted, object is outdated");
                return Ok(ReconcileSignal::requeue(None));
            }
            Err(e) => return Err(e.into()),
        }
    }

    if available {
        Ok(ReconcileSignal::done())
    } else {
        Ok(ReconcileSignal::requeue_after(Duration::from_secs(
            DEFAULT_STATUS_REQUEUE_SECS,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::conditions::{find_by_reason, find_by_type, FixedClock};
    use chrono::TimeZone;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentSpec, DeploymentStatus as K8sDeploymentStatus};
    use kube::api::ObjectMeta;

    fn clock() -> FixedClock {
        FixedClock(chrono::Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap())
    }

    fn apimanager(spec: serde_json::Value) -> APIManager {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "apps.apimanager.dev/v1alpha1",
            "kind": "APIManager",
            "metadata": {"name": "apimanager", "namespace": "api", "uid": "uid-1"},
            "spec": spec,
        }))
        .unwrap()
    }

    fn deployment(name: &str, replicas: i32, available: bool) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..DeploymentSpec::default()
            }),
            status: Some(K8sDeploymentStatus {
                conditions: Some(vec![DeploymentCondition {
                    type_: "Available".to_string(),
                    status: if available { "True" } else { "False" }.to_string(),
                    ..DeploymentCondition::default()
                }]),
                ..K8sDeploymentStatus::default()
            }),
        }
    }

    #[test]
    fn test_rollup_sorts_by_name() {
        let rollup = deployment_rollup(&[
            deployment("zync", 1, true),
            deployment("backend-cron", 0, false),
            deployment("apicast-staging", 1, true),
            deployment("system-app", 1, false),
        ]);
        assert_eq!(rollup.ready, vec!["apicast-staging", "zync"]);
        assert_eq!(rollup.starting, vec!["system-app"]);
        assert_eq!(rollup.stopped, vec!["backend-cron"]);
    }

    #[test]
    fn test_missing_secrets_take_precedence() {
        let observed = Observed {
            expected: vec!["system-app".to_string()],
            missing_secrets: vec!["s3".to_string(), "env-a".to_string()],
            ..Observed::default()
        };
        let condition = available_condition(&observed);
        assert_eq!(condition.reason, REASON_MISSING_WATCHED_SECRETS);
        assert_eq!(
            condition.message,
            "The following secret(s) could not be found: s3, env-a"
        );
    }

    #[test]
    fn test_available_needs_expected_deployments_and_routes() {
        let mut observed = Observed {
            deployments: vec![deployment("system-app", 1, true)],
            expected: vec!["system-app".to_string(), "zync".to_string()],
            routes_ready: true,
            missing_secrets: Vec::new(),
        };
        assert_eq!(available_condition(&observed).reason, REASON_DEPLOYMENTS_NOT_READY);

        observed.deployments.push(deployment("zync", 1, true));
        observed.routes_ready = false;
        assert_eq!(available_condition(&observed).reason, REASON_ROUTES_NOT_READY);

        observed.routes_ready = true;
        assert!(available_condition(&observed).is_true());
    }

    #[test]
    fn test_warnings_follow_spec() {
        let cr = apimanager(serde_json::json!({
            "wildcardDomain": "example.com",
            "resourceRequirementsEnabled": false,
            "apicast": {
                "stagingSpec": {"hpa": true, "openTracing": {"enabled": true}},
            },
        }));
        let status = compute_status(&cr, &Observed::default(), Some(&PreflightReport::Passed), &clock());
        assert!(find_by_reason(&status.conditions, "HPA").is_some());
        assert!(find_by_reason(&status.conditions, "Apicast Staging OpenTracing Deprecation").is_some());
        assert!(find_by_reason(&status.conditions, "Apicast Production OpenTracing Deprecation").is_none());
        assert!(find_by_type(&status.conditions, CONDITION_PREFLIGHTS).unwrap().is_true());
    }

    #[test]
    fn test_failed_preflights_freeze_warnings() {
        let cr = apimanager(serde_json::json!({
            "wildcardDomain": "example.com",
            "apicast": {"productionSpec": {"openTracing": {"enabled": true}}},
        }));
        let report = PreflightReport::Failed {
            detail: "mysql version 5.7 does not meet the required 8.0.0".to_string(),
            retry_in: Duration::from_secs(600),
        };
        let status = compute_status(&cr, &Observed::default(), Some(&report), &clock());
        assert!(find_by_reason(&status.conditions, "Apicast Production OpenTracing Deprecation").is_none());
        assert!(!find_by_type(&status.conditions, CONDITION_PREFLIGHTS).unwrap().is_true());
    }

    #[test]
    fn test_recompute_is_a_fixed_point() {
        let mut cr = apimanager(serde_json::json!({"wildcardDomain": "example.com"}));
        let observed = Observed {
            deployments: vec![deployment("zync", 1, true)],
            expected: vec!["zync".to_string()],
            routes_ready: true,
            missing_secrets: Vec::new(),
        };
        let first = compute_status(&cr, &observed, None, &clock());
        cr.status = Some(first.clone());
        let second = compute_status(&cr, &observed, None, &clock());
        assert!(status_equal(&first, &second).unwrap());
        assert!(second.is_available());
    }
}
