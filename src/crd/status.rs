//! # Status Types
//!
//! Conditions and status structs for the operator's custom resources.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a condition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn from_bool(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }

    pub fn is_true(self) -> bool {
        self == Self::True
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        f.write_str(value)
    }
}

/// Condition represents an observation of a resource's state
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,
    /// Machine-readable reason for the last transition
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Last transition time (RFC3339)
    #[serde(default)]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(
        r#type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type: r#type.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status.is_true()
    }
}

/// Deployment rollup of an APIManager, names sorted alphabetically
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(default)]
    pub ready: Vec<String>,
    #[serde(default)]
    pub starting: Vec<String>,
    #[serde(default)]
    pub stopped: Vec<String>,
}

/// Status of the APIManager resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct APIManagerStatus {
    /// Conditions, persisted sorted by type
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Deployment readiness rollup
    #[serde(default)]
    pub deployments: DeploymentStatus,
    /// Resource version of the requirements snapshot this instance has evaluated
    #[serde(default)]
    pub confirmed_requirements_version: Option<String>,
}

impl APIManagerStatus {
    pub fn is_available(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.r#type == crate::constants::CONDITION_AVAILABLE && c.is_true())
    }
}

/// Status of an APIManagerBackup
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct APIManagerBackupStatus {
    /// Name of the backed up APIManager
    #[serde(default)]
    pub api_manager_source_name: Option<String>,
    /// Name of the volume claim holding the backup
    #[serde(default)]
    pub backup_persistent_volume_claim_name: Option<String>,
    /// Set once every backup job has succeeded
    #[serde(default)]
    pub main_steps_completed: Option<bool>,
    /// Set once cleanup is done; the backup can be consumed
    #[serde(default)]
    pub completed: Option<bool>,
    /// Time the backup started (RFC3339)
    #[serde(default)]
    pub start_time: Option<String>,
    /// Time the backup completed (RFC3339)
    #[serde(default)]
    pub completion_time: Option<String>,
}

/// Status of an APIManagerRestore
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct APIManagerRestoreStatus {
    /// Name of the restored APIManager
    #[serde(default)]
    pub api_manager_to_restore_ref: Option<String>,
    #[serde(default)]
    pub main_steps_completed: Option<bool>,
    #[serde(default)]
    pub completed: Option<bool>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub completion_time: Option<String>,
}

/// Step markers common to backup and restore statuses
pub trait OperationMarkers {
    fn start_time(&self) -> Option<&str>;
    fn set_start_time(&mut self, at: String);
    fn main_steps_completed(&self) -> bool;
    fn set_main_steps_completed(&mut self);
    fn completed(&self) -> bool;
    fn set_completed(&mut self, at: String);
}

macro_rules! impl_operation_markers {
    ($status:ty) => {
        impl OperationMarkers for $status {
            fn start_time(&self) -> Option<&str> {
                self.start_time.as_deref()
            }

            fn set_start_time(&mut self, at: String) {
                self.start_time = Some(at);
            }

            fn main_steps_completed(&self) -> bool {
                self.main_steps_completed.unwrap_or(false)
            }

            fn set_main_steps_completed(&mut self) {
                self.main_steps_completed = Some(true);
            }

            fn completed(&self) -> bool {
                self.completed.unwrap_or(false)
            }

            fn set_completed(&mut self, at: String) {
                self.completed = Some(true);
                self.completion_time = Some(at);
            }
        }
    };
}

impl_operation_markers!(APIManagerBackupStatus);
impl_operation_markers!(APIManagerRestoreStatus);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_wire_shape() {
        let mut condition = Condition::new("Available", ConditionStatus::True, "Ready", "ok");
        condition.last_transition_time = Some("2026-01-01T00:00:00+00:00".to_string());
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "Available");
        assert_eq!(json["status"], "True");
        assert_eq!(json["lastTransitionTime"], "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_markers_are_sticky() {
        let mut status = APIManagerBackupStatus::default();
        assert!(!status.main_steps_completed());
        status.set_main_steps_completed();
        status.set_completed("2026-01-01T00:00:00Z".to_string());
        assert!(status.main_steps_completed());
        assert!(status.completed());
        assert_eq!(status.completion_time.as_deref(), Some("2026-01-01T00:00:00Z"));
    }
}
