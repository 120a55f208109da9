//! # APIManagerBackup
//!
//! Requests a one-off backup of an APIManager's configuration and file storage into a
//! persistent volume claim.

use super::APIManagerBackupStatus;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// APIManagerBackup Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: apps.apimanager.dev/v1alpha1
/// kind: APIManagerBackup
/// metadata:
///   name: nightly
/// spec:
///   backupDestination:
///     persistentVolumeClaim:
///       resources:
///         storage: 10Gi
/// ```
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "APIManagerBackup",
    group = "apps.apimanager.dev",
    version = "v1alpha1",
    namespaced,
    status = "APIManagerBackupStatus",
    shortname = "apimbackup",
    printcolumn = r#"{"name":"Completed", "type":"boolean", "jsonPath":".status.completed"}, {"name":"Claim", "type":"string", "jsonPath":".status.backupPersistentVolumeClaimName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct APIManagerBackupSpec {
    pub backup_destination: BackupDestinationSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupDestinationSpec {
    #[serde(default)]
    pub persistent_volume_claim: Option<BackupPvcSpec>,
}

/// Destination claim settings
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupPvcSpec {
    #[serde(default)]
    pub resources: Option<PvcResources>,
    /// Bind to a pre-provisioned volume
    #[serde(default)]
    pub volume_name: Option<String>,
    #[serde(default)]
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PvcResources {
    /// Requested size, e.g. `10Gi`
    pub storage: String,
}
