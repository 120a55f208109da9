//! # APIManagerRestore
//!
//! Restores an APIManager from a claim previously filled by an APIManagerBackup.

use super::APIManagerRestoreStatus;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// APIManagerRestore Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: apps.apimanager.dev/v1alpha1
/// kind: APIManagerRestore
/// metadata:
///   name: from-nightly
/// spec:
///   restoreSource:
///     persistentVolumeClaim:
///       claimSource:
///         claimName: apimanager-backup-nightly
/// ```
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "APIManagerRestore",
    group = "apps.apimanager.dev",
    version = "v1alpha1",
    namespaced,
    status = "APIManagerRestoreStatus",
    shortname = "apimrestore",
    printcolumn = r#"{"name":"Completed", "type":"boolean", "jsonPath":".status.completed"}, {"name":"APIManager", "type":"string", "jsonPath":".status.apiManagerToRestoreRef"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct APIManagerRestoreSpec {
    pub restore_source: RestoreSourceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSourceSpec {
    pub persistent_volume_claim: RestorePvcSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestorePvcSpec {
    pub claim_source: ClaimSource,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSource {
    pub claim_name: String,
    #[serde(default)]
    pub read_only: bool,
}
