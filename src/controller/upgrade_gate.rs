//! # Upgrade Gate
//!
//! Fleet-wide consensus on whether the operator may be upgraded.
//!
//! Every APIManager records the requirements token it has evaluated successfully. The gate
//! compares those records with the current token and reflects the outcome in the
//! `Upgradeable` condition of the OperatorCondition objects of the operator's subscription.
//! More than one such object means a new operator version is waiting for approval.
//!
//! | all confirmed | upgrade pending | Upgradeable | Reason                    | Target    |
//! |---------------|-----------------|-------------|---------------------------|-----------|
//! | yes           | yes             | True        | `ApprovedUpgradeScenario` | override  |
//! | yes           | no              | False       | `NoUpgradeAvailable`      | condition |
//! | no            | yes             | False       | `UpgradeRejected`         | condition |
//! | no            | no              | False       | `NoUpgradeAvailable`      | condition |

use crate::config::SharedOperatorConfig;
use crate::constants::*;
use crate::controller::conditions::Clock;
use crate::controller::error::ReconcilerError;
use crate::controller::requirements::RequirementsSnapshot;
use crate::controller::steps::ReconcileSignal;
use crate::crd::olm::{OperatorCondition, OperatorConditionSpec, Subscription};
use crate::crd::{APIManager, Condition, ConditionStatus};
use crate::observability;
use crate::store::{from_dynamic, list_as, SharedClient, StoreError};
use kube::core::{ApiResource, DynamicObject};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

/// Which part of the consensus object carries the decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTarget {
    /// `spec.overrides` of the object currently blocking
    Override,
    /// `spec.conditions` of the object holding an override or block; overrides are cleared
    Condition,
}

/// Outcome of the 2×2 decision table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub upgradeable: bool,
    pub reason: &'static str,
    pub message: &'static str,
    pub target: GateTarget,
    /// Re-evaluate after the gate interval
    pub requeue: bool,
}

impl GateDecision {
    pub fn condition(&self) -> Condition {
        let status = if self.upgradeable {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        Condition::new(CONDITION_UPGRADEABLE, status, self.reason, self.message)
    }
}

pub fn decide(all_confirmed: bool, upgrade_pending: bool) -> GateDecision {
    match (all_confirmed, upgrade_pending) {
        (true, true) => GateDecision {
            upgradeable: true,
            reason: REASON_APPROVED_UPGRADE,
            message: "Upgrade approved, requirements confirmed, operator upgrade is ready to progress",
            target: GateTarget::Override,
            requeue: false,
        },
        (true, false) => GateDecision {
            upgradeable: false,
            reason: REASON_NO_UPGRADE_AVAILABLE,
            message: "No new upgrade available, blocking any automatic upgrades",
            target: GateTarget::Condition,
            requeue: false,
        },
        (false, true) => GateDecision {
            upgradeable: false,
            reason: REASON_UPGRADE_REJECTED,
            message: "Requirements are not confirmed yet by all instances that are managed by the operator",
            target: GateTarget::Condition,
            requeue: true,
        },
        (false, false) => GateDecision {
            upgradeable: false,
            reason: REASON_NO_UPGRADE_AVAILABLE,
            message: "No new upgrade available or upgrade is manual and has not been approved yet, requirements for current or incoming installation are not met",
            target: GateTarget::Condition,
            requeue: true,
        },
    }
}

/// True when every instance has confirmed `token`
pub fn all_confirmed(apimanagers: &[APIManager], token: &str) -> bool {
    apimanagers.iter().all(|apimanager| {
        apimanager
            .status
            .as_ref()
            .and_then(|s| s.confirmed_requirements_version.as_deref())
            == Some(token)
    })
}

/// `desired` with the transition time of a matching entry in `existing` carried over
fn carry_transition(existing: &[Condition], mut desired: Condition, now: &str) -> Condition {
    desired.last_transition_time = existing
        .iter()
        .find(|c| c.r#type == desired.r#type && c.status == desired.status)
        .and_then(|c| c.last_transition_time.clone())
        .or_else(|| Some(now.to_string()));
    desired
}

/// Desired spec of `object` for `decision`; `None` when nothing would change
pub fn apply_decision(
    object: &OperatorCondition,
    decision: &GateDecision,
    now: &str,
) -> Option<OperatorCondition> {
    let mut updated = object.clone();
    match decision.target {
        GateTarget::Override => {
            let cond = carry_transition(&object.spec.overrides, decision.condition(), now);
            updated.spec.overrides = vec![cond];
        }
        GateTarget::Condition => {
            let cond = carry_transition(&object.spec.conditions, decision.condition(), now);
            updated.spec.conditions = vec![cond];
            updated.spec.overrides.clear();
        }
    }
    (updated.spec != object.spec).then_some(updated)
}

/// Index of the consensus object the decision is written to
///
/// An approval goes to the blocking object. Any other decision goes to the object holding an
/// override, then the blocking object, then the first by name.
fn target_index(objects: &[OperatorCondition], decision: &GateDecision) -> Option<usize> {
    let blocking = || objects.iter().position(OperatorCondition::is_blocking);
    match decision.target {
        GateTarget::Override => blocking(),
        GateTarget::Condition => objects
            .iter()
            .position(|o| !o.spec.overrides.is_empty())
            .or_else(blocking)
            .or((!objects.is_empty()).then_some(0)),
    }
}

/// Consensus objects to rewrite for `decision`, by index into `objects`
///
/// A condition decision also clears overrides left on every other object, so no approval
/// survives a rejection.
pub fn plan_writes(
    objects: &[OperatorCondition],
    decision: &GateDecision,
    now: &str,
) -> Vec<(usize, OperatorCondition)> {
    let target = target_index(objects, decision);
    objects
        .iter()
        .enumerate()
        .filter_map(|(index, object)| {
            let updated = if Some(index) == target {
                apply_decision(object, decision, now)
            } else if decision.target == GateTarget::Condition
                && !object.spec.overrides.is_empty()
            {
                let mut cleared = object.clone();
                cleared.spec.overrides.clear();
                Some(cleared)
            } else {
                None
            };
            updated.map(|updated| (index, updated))
        })
        .collect()
}

/// `object` with its spec conditions and overrides taken from `spec`; every other field is kept
fn with_gate_fields(
    object: &DynamicObject,
    spec: &OperatorConditionSpec,
) -> Result<DynamicObject, StoreError> {
    let mut updated = object.clone();
    let data = updated
        .data
        .as_object_mut()
        .ok_or(StoreError::Incomplete("spec"))?;
    let fields = data
        .entry("spec")
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()))
        .as_object_mut()
        .ok_or(StoreError::Incomplete("spec"))?;
    fields.insert("conditions".to_string(), serde_json::to_value(&spec.conditions)?);
    fields.insert("overrides".to_string(), serde_json::to_value(&spec.overrides)?);
    Ok(updated)
}

/// Evaluates and writes the upgrade decision for one subscription
pub struct UpgradeGate {
    client: SharedClient,
    config: SharedOperatorConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for UpgradeGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeGate").finish_non_exhaustive()
    }
}

impl UpgradeGate {
    pub fn new(client: SharedClient, config: SharedOperatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            config,
            clock,
        }
    }

    pub async fn reconcile(
        &self,
        subscription: &Subscription,
    ) -> Result<ReconcileSignal, ReconcilerError> {
        let client = self.client.as_ref();
        let retry = ReconcileSignal::requeue_after(self.config.gate_requeue());

        let Some(snapshot) =
            RequirementsSnapshot::load(client, &self.config.operator_namespace).await?
        else {
            debug!("Requirements not published yet, upgrade gate waits");
            return Ok(retry);
        };

        let apimanagers =
            list_as::<APIManager>(client, self.config.watch_namespace.as_deref(), None).await?;
        if apimanagers.is_empty() {
            debug!("No APIManager instances, upgrade gate waits");
            return Ok(retry);
        }
        let confirmed = all_confirmed(&apimanagers, &snapshot.token);

        let selector = self.config.operator_condition_label(&subscription.name_any());
        let mut objects = client
            .list(
                &ApiResource::erase::<OperatorCondition>(&()),
                Some(&self.config.operator_namespace),
                Some(&selector),
            )
            .await?
            .into_iter()
            .map(|raw| from_dynamic::<OperatorCondition>(&raw).map(|typed| (raw, typed)))
            .collect::<Result<Vec<_>, _>>()?;
        objects.sort_by_key(|(_, typed)| typed.name_any());
        let typed: Vec<OperatorCondition> = objects.iter().map(|(_, t)| t.clone()).collect();
        let pending = typed.len() > 1;

        let decision = decide(confirmed, pending);
        observability::metrics::increment_gate_decisions_total(decision.reason);
        let signal = if decision.requeue {
            retry
        } else {
            ReconcileSignal::done()
        };

        let writes = plan_writes(&typed, &decision, &self.clock.now_rfc3339());
        if writes.is_empty() {
            debug!(reason = decision.reason, "Upgrade gate unchanged");
            return Ok(signal);
        }
        for (index, updated) in writes {
            let (raw, _) = &objects[index];
            match client.update(&with_gate_fields(raw, &updated.spec)?).await {
                Ok(_) => info!(
                    "✅ Upgradeable={} ({}) written to {}",
                    decision.upgradeable,
                    decision.reason,
                    updated.name_any()
                ),
                Err(StoreError::Conflict(_)) => {
                    debug!("Consensus object changed underneath, re-evaluating");
                    return Ok(ReconcileSignal::requeue(None));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::APIManagerStatus;
    use kube::api::ObjectMeta;

    fn apimanager(confirmed: Option<&str>) -> APIManager {
        let mut apimanager = APIManager::new("apimanager", Default::default());
        apimanager.status = Some(APIManagerStatus {
            confirmed_requirements_version: confirmed.map(str::to_string),
            ..APIManagerStatus::default()
        });
        apimanager
    }

    fn blocking() -> OperatorCondition {
        OperatorCondition {
            metadata: ObjectMeta {
                name: Some("operator.v1".to_string()),
                ..ObjectMeta::default()
            },
            spec: OperatorConditionSpec {
                conditions: vec![decide(true, false).condition()],
                overrides: Vec::new(),
            },
        }
    }

    #[test]
    fn test_decision_table() {
        let approved = decide(true, true);
        assert!(approved.upgradeable);
        assert_eq!(approved.target, GateTarget::Override);
        assert!(!approved.requeue);

        let idle = decide(true, false);
        assert_eq!(idle.reason, REASON_NO_UPGRADE_AVAILABLE);
        assert!(!idle.requeue);

        let rejected = decide(false, true);
        assert_eq!(rejected.reason, REASON_UPGRADE_REJECTED);
        assert_eq!(rejected.target, GateTarget::Condition);
        assert!(rejected.requeue);

        let unmet = decide(false, false);
        assert_eq!(unmet.reason, REASON_NO_UPGRADE_AVAILABLE);
        assert!(!unmet.upgradeable);
        assert!(unmet.requeue);
        assert_ne!(unmet.message, idle.message);
    }

    #[test]
    fn test_all_confirmed_requires_every_instance() {
        let fleet = vec![apimanager(Some("7")), apimanager(Some("6"))];
        assert!(!all_confirmed(&fleet, "7"));
        let fleet = vec![apimanager(Some("7")), apimanager(Some("7"))];
        assert!(all_confirmed(&fleet, "7"));
        assert!(!all_confirmed(&[apimanager(None)], "7"));
    }

    #[test]
    fn test_apply_decision_is_idempotent() {
        let object = blocking();
        let decision = decide(true, true);
        let updated = apply_decision(&object, &decision, "2026-01-01T00:00:00Z").unwrap();
        assert_eq!(updated.spec.overrides.len(), 1);
        assert_eq!(updated.spec.conditions, object.spec.conditions);
        assert!(apply_decision(&updated, &decision, "2026-02-01T00:00:00Z").is_none());
    }

    #[test]
    fn test_condition_target_clears_overrides() {
        let mut object = blocking();
        object.spec.overrides = vec![decide(true, true).condition()];
        let updated = apply_decision(&object, &decide(false, true), "now").unwrap();
        assert!(updated.spec.overrides.is_empty());
        assert_eq!(updated.spec.conditions[0].reason, REASON_UPGRADE_REJECTED);
    }

    fn named(name: &str, conditions: Vec<Condition>, overrides: Vec<Condition>) -> OperatorCondition {
        OperatorCondition {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec: OperatorConditionSpec {
                conditions,
                overrides,
            },
        }
    }

    #[test]
    fn test_rejection_reaches_approved_object_sorting_second() {
        // v0.10.0 sorts before the installed v0.9.0
        let objects = vec![
            named("operator.v0.10.0", Vec::new(), Vec::new()),
            named(
                "operator.v0.9.0",
                vec![decide(true, false).condition()],
                vec![decide(true, true).condition()],
            ),
        ];

        let writes = plan_writes(&objects, &decide(false, true), "now");
        assert_eq!(writes.len(), 1);
        let (index, updated) = &writes[0];
        assert_eq!(*index, 1);
        assert!(updated.spec.overrides.is_empty());
        assert_eq!(updated.spec.conditions[0].reason, REASON_UPGRADE_REJECTED);
    }

    #[test]
    fn test_condition_decision_clears_stray_overrides() {
        let objects = vec![
            named("operator.a", vec![decide(true, false).condition()], Vec::new()),
            named("operator.b", Vec::new(), vec![decide(true, true).condition()]),
        ];
        let writes = plan_writes(&objects, &decide(false, true), "now");
        let indices: Vec<usize> = writes.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![1]);
        assert!(writes[0].1.spec.overrides.is_empty());
        assert_eq!(writes[0].1.spec.conditions[0].reason, REASON_UPGRADE_REJECTED);

        // Once the override is gone the rejection lands on the blocking object
        let objects = vec![
            named("operator.a", vec![decide(true, false).condition()], Vec::new()),
            named("operator.b", Vec::new(), Vec::new()),
        ];
        let writes = plan_writes(&objects, &decide(false, true), "now");
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 0);
    }

    #[test]
    fn test_approval_without_blocking_object_writes_nothing() {
        let objects = vec![named("operator.a", Vec::new(), Vec::new())];
        assert!(plan_writes(&objects, &decide(true, true), "now").is_empty());
    }

    #[test]
    fn test_gate_fields_leave_the_rest_of_the_spec() {
        let raw: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "operators.coreos.com/v2",
            "kind": "OperatorCondition",
            "metadata": {"name": "operator.v1"},
            "spec": {
                "serviceAccounts": ["operator"],
                "deployments": ["operator"],
                "conditions": [],
            },
        }))
        .unwrap();
        let spec = OperatorConditionSpec {
            conditions: vec![decide(true, false).condition()],
            overrides: Vec::new(),
        };
        let updated = with_gate_fields(&raw, &spec).unwrap();
        assert_eq!(updated.data["spec"]["serviceAccounts"], serde_json::json!(["operator"]));
        assert_eq!(updated.data["spec"]["deployments"], serde_json::json!(["operator"]));
        assert_eq!(
            updated.data["spec"]["conditions"][0]["reason"],
            serde_json::json!(REASON_NO_UPGRADE_AVAILABLE)
        );
        assert_eq!(updated.data["spec"]["overrides"], serde_json::json!([]));
    }
}
