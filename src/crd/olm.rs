//! # Operator Lifecycle Manager Types
//!
//! Minimal typed views of the OLM resources the upgrade gate and the requirements publisher
//! read or write. Only the fields the operator touches are modelled. Writes to an
//! OperatorCondition go through the fetched dynamic object and replace only `spec.conditions`
//! and `spec.overrides`.

use super::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Fleet-wide consensus object; OLM blocks an upgrade while `Upgradeable=False`
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "OperatorCondition",
    group = "operators.coreos.com",
    version = "v2",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConditionSpec {
    /// Conditions reported by the operator
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Administrative overrides taking precedence over `conditions`
    #[serde(default)]
    pub overrides: Vec<Condition>,
}

impl OperatorCondition {
    /// True when this object currently blocks upgrades
    pub fn is_blocking(&self) -> bool {
        self.spec.conditions.iter().any(|c| {
            c.r#type == crate::constants::CONDITION_UPGRADEABLE
                && c.status == super::ConditionStatus::False
        })
    }
}

/// Subscription of the operator package
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "Subscription",
    group = "operators.coreos.com",
    version = "v1alpha1",
    namespaced,
    status = "SubscriptionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    /// Package name
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub install_plan_approval: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    #[serde(default)]
    pub install_plan_ref: Option<ObjectReference>,
    #[serde(default)]
    pub current_csv: Option<String>,
    #[serde(default)]
    pub installed_csv: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Install plan resolving the next operator version
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "InstallPlan",
    group = "operators.coreos.com",
    version = "v1alpha1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct InstallPlanSpec {
    #[serde(default)]
    pub cluster_service_version_names: Vec<String>,
    #[serde(default)]
    pub approved: bool,
}

/// Manifest of an operator version; only its annotations are consumed
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "ClusterServiceVersion",
    group = "operators.coreos.com",
    version = "v1alpha1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceVersionSpec {
    #[serde(default)]
    pub version: Option<String>,
}
