//! Identity the backup and restore jobs run as.

use crate::controller::error::ReconcilerError;
use crate::store::{to_dynamic, Desired};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

/// ServiceAccount, Role and RoleBinding named `name`, all create-only
pub fn permission_objects<O>(
    owner: &O,
    name: &str,
    rules: Vec<PolicyRule>,
) -> Result<Vec<Desired>, ReconcilerError>
where
    O: Resource<DynamicType = ()>,
{
    let owner_ref = owner
        .controller_owner_ref(&())
        .ok_or(ReconcilerError::MissingObjectKey("metadata.uid"))?;
    let namespace = owner
        .namespace()
        .ok_or(ReconcilerError::MissingObjectKey("metadata.namespace"))?;
    let meta = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.clone()),
        owner_references: Some(vec![owner_ref]),
        ..ObjectMeta::default()
    };

    let service_account = ServiceAccount {
        metadata: meta.clone(),
        ..ServiceAccount::default()
    };
    let role = Role {
        metadata: meta.clone(),
        rules: Some(rules),
    };
    let binding = RoleBinding {
        metadata: meta,
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: name.to_string(),
            namespace: Some(namespace),
            ..Subject::default()
        }]),
    };

    Ok(vec![
        Desired::create_only(to_dynamic(&service_account)?),
        Desired::create_only(to_dynamic(&role)?),
        Desired::create_only(to_dynamic(&binding)?),
    ])
}

/// Rule granting `verbs` on `resources` of `group`
pub fn rule(group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..PolicyRule::default()
    }
}
