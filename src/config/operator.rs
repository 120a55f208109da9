//! # Operator Settings
//!
//! Namespaces, versions, job image and the poll/requeue intervals used by the controllers.

use super::{env_var_opt, env_var_or_default};
use crate::constants::*;
use std::time::Duration;

/// Operator-level configuration
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace the managed resources live in; `None` watches every namespace
    pub watch_namespace: Option<String>,
    /// Namespace the operator runs in (holds the requirements snapshot)
    pub operator_namespace: String,
    /// Version of the running operator, compared against the installed-version annotation
    pub operator_version: String,
    /// Platform release shipped by this operator
    pub release_version: String,
    /// OLM package name used to pick the operator's own Subscription
    pub package_name: String,
    /// Image used by backup and restore jobs
    pub backup_job_image: String,
    pub job_poll_interval_secs: u64,
    pub preflight_retry_secs: u64,
    pub gate_requeue_secs: u64,
    pub install_plan_poll_interval_secs: u64,
    pub install_plan_timeout_secs: u64,
    /// Skip requirement evaluation entirely (air-gapped or manual installs)
    pub preflights_disabled: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            operator_namespace: "apimanager-system".to_string(),
            operator_version: env!("CARGO_PKG_VERSION").to_string(),
            release_version: DEFAULT_RELEASE_VERSION.to_string(),
            package_name: "apimanager-operator".to_string(),
            backup_job_image: DEFAULT_BACKUP_JOB_IMAGE.to_string(),
            job_poll_interval_secs: DEFAULT_JOB_POLL_INTERVAL_SECS,
            preflight_retry_secs: DEFAULT_PREFLIGHT_RETRY_SECS,
            gate_requeue_secs: DEFAULT_GATE_REQUEUE_SECS,
            install_plan_poll_interval_secs: DEFAULT_INSTALL_PLAN_POLL_INTERVAL_SECS,
            install_plan_timeout_secs: DEFAULT_INSTALL_PLAN_TIMEOUT_SECS,
            preflights_disabled: false,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            watch_namespace: env_var_opt("WATCH_NAMESPACE"),
            operator_namespace: env_var_opt("OPERATOR_NAMESPACE")
                .unwrap_or(defaults.operator_namespace),
            operator_version: env_var_opt("OPERATOR_VERSION").unwrap_or(defaults.operator_version),
            release_version: env_var_opt("RELEASE_VERSION").unwrap_or(defaults.release_version),
            package_name: env_var_opt("OPERATOR_PACKAGE_NAME").unwrap_or(defaults.package_name),
            backup_job_image: env_var_opt("BACKUP_JOB_IMAGE").unwrap_or(defaults.backup_job_image),
            job_poll_interval_secs: env_var_or_default(
                "JOB_POLL_INTERVAL_SECS",
                DEFAULT_JOB_POLL_INTERVAL_SECS,
            ),
            preflight_retry_secs: env_var_or_default(
                "PREFLIGHT_RETRY_SECS",
                DEFAULT_PREFLIGHT_RETRY_SECS,
            ),
            gate_requeue_secs: env_var_or_default("GATE_REQUEUE_SECS", DEFAULT_GATE_REQUEUE_SECS),
            install_plan_poll_interval_secs: env_var_or_default(
                "INSTALL_PLAN_POLL_INTERVAL_SECS",
                DEFAULT_INSTALL_PLAN_POLL_INTERVAL_SECS,
            ),
            install_plan_timeout_secs: env_var_or_default(
                "INSTALL_PLAN_TIMEOUT_SECS",
                DEFAULT_INSTALL_PLAN_TIMEOUT_SECS,
            ),
            preflights_disabled: env_var_or_default("PREFLIGHTS_DISABLED", false),
        }
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_secs(self.job_poll_interval_secs)
    }

    pub fn preflight_retry(&self) -> Duration {
        Duration::from_secs(self.preflight_retry_secs)
    }

    pub fn gate_requeue(&self) -> Duration {
        Duration::from_secs(self.gate_requeue_secs)
    }

    pub fn install_plan_poll_interval(&self) -> Duration {
        Duration::from_secs(self.install_plan_poll_interval_secs)
    }

    pub fn install_plan_timeout(&self) -> Duration {
        Duration::from_secs(self.install_plan_timeout_secs)
    }

    /// Label selecting the consensus objects that belong to this operator's subscription
    pub fn operator_condition_label(&self, subscription: &str) -> String {
        format!(
            "{OPERATOR_CONDITION_LABEL_PREFIX}/{subscription}.{}",
            self.operator_namespace
        )
    }
}
