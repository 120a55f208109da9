//! # Subscription Reconciler
//!
//! Publishes the requirements of the operator version being installed and then runs the
//! upgrade gate.
//!
//! The subscription's install plan names the incoming ClusterServiceVersion. Its requirement
//! annotations are copied into the requirements ConfigMap, whose `resourceVersion` becomes the
//! token every APIManager has to confirm before the upgrade gate opens.

use crate::constants::{CSV_REQUIREMENT_ANNOTATIONS, REQUIREMENTS_CONFIG_MAP};
use crate::controller::error::ReconcilerError;
use crate::controller::reconciler::{backoff_key, Reconciler};
use crate::controller::steps::ReconcileSignal;
use crate::controller::upgrade_gate::UpgradeGate;
use crate::crd::olm::{ClusterServiceVersion, InstallPlan, ObjectReference, Subscription};
use crate::observability;
use crate::store::{ensure, get_as, to_dynamic, Desired, EnsureOutcome, Mutator};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, Instrument};

/// Requirement values carried by a CSV; missing annotations become empty values
pub fn requirements_from_annotations(
    annotations: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    CSV_REQUIREMENT_ANNOTATIONS
        .iter()
        .map(|(key, annotation)| {
            (
                (*key).to_string(),
                annotations.get(*annotation).cloned().unwrap_or_default(),
            )
        })
        .collect()
}

/// Wait for the subscription to reference an install plan
async fn await_install_plan_ref(
    reconciler: &Reconciler,
    namespace: &str,
    name: &str,
) -> Result<Option<ObjectReference>, ReconcilerError> {
    let client = reconciler.client.as_ref();
    let poll = reconciler.config.install_plan_poll_interval();
    let wait = async {
        loop {
            let Some(subscription) = get_as::<Subscription>(client, namespace, name).await? else {
                return Ok(None);
            };
            if let Some(reference) = subscription.status.and_then(|s| s.install_plan_ref) {
                return Ok(Some(reference));
            }
            debug!("Subscription {namespace}/{name} has no install plan yet");
            tokio::time::sleep(poll).await;
        }
    };
    tokio::time::timeout(reconciler.config.install_plan_timeout(), wait)
        .await
        .map_err(|_elapsed| ReconcilerError::InstallPlanTimeout(format!("{namespace}/{name}")))?
}

/// Copy the incoming CSV's requirements into the requirements ConfigMap
///
/// Returns `false` when the install plan or its CSV cannot be read yet.
pub async fn publish_requirements(
    reconciler: &Reconciler,
    namespace: &str,
    name: &str,
) -> Result<bool, ReconcilerError> {
    let client = reconciler.client.as_ref();
    let Some(reference) = await_install_plan_ref(reconciler, namespace, name).await? else {
        return Ok(false);
    };
    let plan_namespace = reference.namespace.as_deref().unwrap_or(namespace);
    let Some(plan) = get_as::<InstallPlan>(client, plan_namespace, &reference.name).await? else {
        debug!("InstallPlan {plan_namespace}/{} not found", reference.name);
        return Ok(false);
    };
    let Some(csv_name) = plan.spec.cluster_service_version_names.first() else {
        debug!("InstallPlan {plan_namespace}/{} names no CSV", reference.name);
        return Ok(false);
    };
    let Some(csv) = get_as::<ClusterServiceVersion>(client, plan_namespace, csv_name).await?
    else {
        debug!("ClusterServiceVersion {plan_namespace}/{csv_name} not found");
        return Ok(false);
    };

    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(REQUIREMENTS_CONFIG_MAP.to_string()),
            namespace: Some(reconciler.config.operator_namespace.clone()),
            ..ObjectMeta::default()
        },
        data: Some(requirements_from_annotations(csv.annotations())),
        ..ConfigMap::default()
    };
    let outcome = ensure(
        client,
        Desired::merged(to_dynamic(&config_map)?, Mutator::MERGE_DATA),
    )
    .await?;
    if matches!(outcome, EnsureOutcome::Created | EnsureOutcome::Updated) {
        info!("✅ Published requirements of {csv_name}");
    }
    Ok(true)
}

/// Controller entry point
pub async fn reconcile_subscription(
    subscription: Arc<Subscription>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let name = subscription.name_any();
    let namespace = subscription
        .namespace()
        .ok_or(ReconcilerError::MissingObjectKey("metadata.namespace"))?;
    if subscription.spec.name != ctx.config.package_name {
        return Ok(Action::await_change());
    }

    let span = info_span!(
        "subscription.reconcile",
        resource.name = %name,
        resource.namespace = %namespace,
        resource.kind = "Subscription"
    );
    let start = Instant::now();
    observability::metrics::increment_reconciliations_total("subscription");

    let result = reconcile_subscription_pass(&ctx, &subscription)
        .instrument(span)
        .await;
    observability::metrics::observe_reconciliation_duration(
        "subscription",
        start.elapsed().as_secs_f64(),
    );

    let signal = result?;
    ctx.reset_backoff(&backoff_key("Subscription", &namespace, &name));
    Ok(signal.into_action())
}

/// Publish requirements, then evaluate the upgrade gate
pub async fn reconcile_subscription_pass(
    reconciler: &Reconciler,
    subscription: &Subscription,
) -> Result<ReconcileSignal, ReconcilerError> {
    let name = subscription.name_any();
    let namespace = subscription
        .namespace()
        .ok_or(ReconcilerError::MissingObjectKey("metadata.namespace"))?;

    let published = publish_requirements(reconciler, &namespace, &name).await?;
    let gate = UpgradeGate::new(
        reconciler.client.clone(),
        reconciler.config.clone(),
        reconciler.clock.clone(),
    );
    let signal = gate.reconcile(subscription).await?;
    if published {
        Ok(signal)
    } else {
        Ok(signal.merge(ReconcileSignal::requeue_after(
            reconciler.config.install_plan_poll_interval(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{REQ_MYSQL_VERSION, REQ_PLATFORM_VERSION};

    #[test]
    fn test_missing_annotations_become_empty() {
        let annotations: BTreeMap<String, String> = [(
            "apps.apimanager.dev/platform-version-requirements".to_string(),
            "2.15".to_string(),
        )]
        .into();
        let values = requirements_from_annotations(&annotations);
        assert_eq!(values.len(), CSV_REQUIREMENT_ANNOTATIONS.len());
        assert_eq!(values[REQ_PLATFORM_VERSION], "2.15");
        assert_eq!(values[REQ_MYSQL_VERSION], "");
    }
}
