//! # Preflights
//!
//! Requirement confirmation for one APIManager.
//!
//! The subscription controller publishes the component versions the incoming operator needs.
//! Each instance checks its own components against that snapshot and records the snapshot
//! token in `status.confirmedRequirementsVersion` once they pass. The upgrade gate counts
//! those confirmations.

use super::DriverContext;
use crate::constants::*;
use crate::controller::error::ReconcilerError;
use crate::controller::requirements::{is_multi_minor_hop, satisfies, RequirementsSnapshot};
use crate::controller::steps::{Step, StepOutcome};
use crate::crd::{APIManager, Condition, ConditionStatus, DatabaseEngine};
use crate::store::{update_as, update_status_as};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Version of one component as far as the operator can tell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbedVersion {
    /// Deployed by the operator; meets requirements by construction
    Internal,
    /// Managed outside the operator; the version is whatever was declared, if anything
    External(Option<String>),
}

/// Versions of the components a requirement can target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentVersions {
    /// `None` when the database runs on the other engine
    pub mysql: Option<ProbedVersion>,
    pub postgres: Option<ProbedVersion>,
    pub system_redis: ProbedVersion,
    pub backend_redis: ProbedVersion,
}

/// Reports component versions of an APIManager
#[async_trait]
pub trait VersionProbe: Send + Sync {
    async fn versions(&self, apimanager: &APIManager) -> Result<ComponentVersions, ReconcilerError>;
}

/// Trusts the versions declared under `externalComponents`
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclaredVersionProbe;

#[async_trait]
impl VersionProbe for DeclaredVersionProbe {
    async fn versions(&self, apimanager: &APIManager) -> Result<ComponentVersions, ReconcilerError> {
        let external = apimanager.external_components();
        let probed = |enabled: bool, version: Option<String>| {
            if enabled {
                ProbedVersion::External(version)
            } else {
                ProbedVersion::Internal
            }
        };

        let database = external.system_database.unwrap_or_default();
        let engine = database.engine;
        let database = probed(database.enabled, database.version);
        let (mysql, postgres) = match engine {
            DatabaseEngine::Mysql => (Some(database), None),
            DatabaseEngine::Postgresql => (None, Some(database)),
        };

        let redis = |spec: Option<crate::crd::ExternalComponentSpec>| {
            let spec = spec.unwrap_or_default();
            probed(spec.enabled, spec.version)
        };

        Ok(ComponentVersions {
            mysql,
            postgres,
            system_redis: redis(external.system_redis),
            backend_redis: redis(external.backend_redis),
        })
    }
}

/// Outcome of the preflight checks for this pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreflightReport {
    Passed,
    Failed { detail: String, retry_in: Duration },
    /// Fresh install waiting for the requirements snapshot
    Pending,
    MultiMinor { detail: String },
    Disabled,
}

impl PreflightReport {
    /// Preflights condition for the report; `None` leaves the condition alone
    pub fn to_condition(&self) -> Option<Condition> {
        let (status, reason, message) = match self {
            Self::Passed => (
                ConditionStatus::True,
                REASON_PREFLIGHTS_PASS,
                "All requirements for the current version are met".to_string(),
            ),
            Self::Failed { detail, retry_in } => (
                ConditionStatus::False,
                REASON_PREFLIGHTS_FAILED,
                format!(
                    "Preflights failed - {detail} - re-running preflights in {} minutes",
                    retry_in.as_secs() / 60
                ),
            ),
            Self::Pending => (
                ConditionStatus::False,
                REASON_REQUIREMENTS_PENDING,
                "Requirement config map is not found yet, it should be generated shortly"
                    .to_string(),
            ),
            Self::MultiMinor { detail } => (
                ConditionStatus::False,
                REASON_MULTI_MINOR_UPGRADE,
                format!(
                    "Preflights failed - {detail}. Multi minor version hop detected. Reconciliation of this instance is stopped until releases are installed one minor version at a time"
                ),
            ),
            Self::Disabled => return None,
        };
        Some(Condition::new(CONDITION_PREFLIGHTS, status, reason, message))
    }
}

/// Report a release jump of more than one minor version
pub fn multi_minor_hop(apimanager: &APIManager, running_release: &str) -> Option<PreflightReport> {
    let installed = apimanager.release_version_annotation()?;
    if is_multi_minor_hop(installed, running_release)? {
        return Some(PreflightReport::MultiMinor {
            detail: format!("installed release {installed}, incoming release {running_release}"),
        });
    }
    None
}

/// Check component versions against the snapshot; `Err` carries every unmet requirement
pub fn check_requirements(
    snapshot: &RequirementsSnapshot,
    versions: &ComponentVersions,
    installed_release: Option<&str>,
) -> Result<(), String> {
    let mut failures = Vec::new();

    if let (Some(required), Some(installed)) = (snapshot.get(REQ_PLATFORM_VERSION), installed_release)
    {
        match satisfies(required, installed) {
            Some(true) => {}
            Some(false) => failures.push(format!(
                "installed release {installed} is older than the required {required}"
            )),
            None => failures.push(format!(
                "cannot compare installed release {installed} with {required}"
            )),
        }
    }

    let components = [
        ("mysql", REQ_MYSQL_VERSION, versions.mysql.as_ref()),
        ("postgres", REQ_POSTGRES_VERSION, versions.postgres.as_ref()),
        ("system redis", REQ_SYSTEM_REDIS_VERSION, Some(&versions.system_redis)),
        ("backend redis", REQ_BACKEND_REDIS_VERSION, Some(&versions.backend_redis)),
    ];
    for (label, key, probed) in components {
        let (Some(required), Some(ProbedVersion::External(declared))) = (snapshot.get(key), probed)
        else {
            continue;
        };
        match declared.as_deref().map(|current| satisfies(required, current)) {
            Some(Some(true)) => {}
            Some(Some(false)) => failures.push(format!(
                "{label} version {} does not meet the required {required}",
                declared.as_deref().unwrap_or_default()
            )),
            Some(None) => failures.push(format!(
                "{label} version {} cannot be compared with {required}",
                declared.as_deref().unwrap_or_default()
            )),
            None => failures.push(format!("{label} version is unknown, {required} is required")),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join(", "))
    }
}

/// Confirms the published requirements for this instance
#[derive(Debug, Clone, Copy, Default)]
pub struct PreflightStep;

#[async_trait]
impl Step<DriverContext> for PreflightStep {
    fn name(&self) -> &'static str {
        "preflights"
    }

    async fn run(&self, ctx: &mut DriverContext) -> Result<StepOutcome, ReconcilerError> {
        if ctx.config.preflights_disabled {
            ctx.preflight = Some(PreflightReport::Disabled);
            return Ok(StepOutcome::Continue);
        }

        let snapshot =
            RequirementsSnapshot::load(ctx.client.as_ref(), &ctx.config.operator_namespace).await?;
        let Some(snapshot) = snapshot else {
            if ctx.apimanager.is_fresh_install() {
                ctx.preflight = Some(PreflightReport::Pending);
                return Ok(StepOutcome::requeue_after(Duration::from_secs(
                    DEFAULT_STATUS_REQUEUE_SECS,
                )));
            }
            debug!("Requirements snapshot not published, keeping the last confirmation");
            return Ok(StepOutcome::Continue);
        };

        let confirmed = ctx
            .apimanager
            .status
            .as_ref()
            .and_then(|status| status.confirmed_requirements_version.as_deref());
        if confirmed == Some(snapshot.token.as_str()) {
            ctx.preflight = Some(PreflightReport::Passed);
            return Ok(StepOutcome::Continue);
        }

        let versions = ctx.probe.versions(&ctx.apimanager).await?;
        match check_requirements(
            &snapshot,
            &versions,
            ctx.apimanager.release_version_annotation(),
        ) {
            Ok(()) => {
                confirm(ctx, &snapshot.token).await?;
                info!("✅ Requirements {} confirmed", snapshot.token);
                ctx.preflight = Some(PreflightReport::Passed);
                Ok(StepOutcome::Requeue(None))
            }
            Err(detail) => {
                warn!("Preflights failed: {detail}");
                let retry_in = ctx.config.preflight_retry();
                ctx.preflight = Some(PreflightReport::Failed { detail, retry_in });
                Ok(StepOutcome::requeue_after(retry_in))
            }
        }
    }
}

/// Record the confirmation in status and mirror it in an annotation
async fn confirm(ctx: &DriverContext, token: &str) -> Result<(), ReconcilerError> {
    let mut annotated = ctx.apimanager.clone();
    annotated
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(CONFIRMED_REQUIREMENTS_ANNOTATION.to_string(), token.to_string());
    let mut written = if annotated.metadata.annotations == ctx.apimanager.metadata.annotations {
        annotated
    } else {
        update_as(ctx.client.as_ref(), &annotated).await?
    };
    written
        .status
        .get_or_insert_with(Default::default)
        .confirmed_requirements_version = Some(token.to_string());
    update_status_as(ctx.client.as_ref(), &written).await?;
    Ok(())
}

/// Stamps the platform release once preflights let the installation proceed
#[derive(Debug, Clone, Copy, Default)]
pub struct ReleaseStampStep;

#[async_trait]
impl Step<DriverContext> for ReleaseStampStep {
    fn name(&self) -> &'static str {
        "release-stamp"
    }

    async fn run(&self, ctx: &mut DriverContext) -> Result<StepOutcome, ReconcilerError> {
        let release = ctx.config.release_version.as_str();
        if ctx.apimanager.release_version_annotation() == Some(release) {
            return Ok(StepOutcome::Continue);
        }
        let mut stamped = ctx.apimanager.clone();
        stamped
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(RELEASE_VERSION_ANNOTATION.to_string(), release.to_string());
        update_as(ctx.client.as_ref(), &stamped).await?;
        info!("✅ Stamped release {release}");
        Ok(StepOutcome::Requeue(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot(values: &[(&str, &str)]) -> RequirementsSnapshot {
        RequirementsSnapshot {
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            token: "7".to_string(),
        }
    }

    fn internal() -> ComponentVersions {
        ComponentVersions {
            mysql: Some(ProbedVersion::Internal),
            postgres: None,
            system_redis: ProbedVersion::Internal,
            backend_redis: ProbedVersion::Internal,
        }
    }

    #[test]
    fn test_internal_components_always_pass() {
        let snap = snapshot(&[(REQ_MYSQL_VERSION, "8.0.0"), (REQ_BACKEND_REDIS_VERSION, "6.2.0")]);
        assert!(check_requirements(&snap, &internal(), None).is_ok());
    }

    #[test]
    fn test_external_component_below_requirement_fails() {
        let snap = snapshot(&[(REQ_BACKEND_REDIS_VERSION, "6.2.0")]);
        let versions = ComponentVersions {
            backend_redis: ProbedVersion::External(Some("5.0.7".to_string())),
            ..internal()
        };
        let detail = check_requirements(&snap, &versions, None).unwrap_err();
        assert!(detail.contains("backend redis version 5.0.7"));
    }

    #[test]
    fn test_undeclared_external_version_fails() {
        let snap = snapshot(&[(REQ_MYSQL_VERSION, "8.0.0")]);
        let versions = ComponentVersions {
            mysql: Some(ProbedVersion::External(None)),
            ..internal()
        };
        assert!(check_requirements(&snap, &versions, None)
            .unwrap_err()
            .contains("unknown"));
    }

    #[test]
    fn test_platform_requirement_checks_installed_release() {
        let snap = snapshot(&[(REQ_PLATFORM_VERSION, "2.14.0")]);
        assert!(check_requirements(&snap, &internal(), Some("2.14.1")).is_ok());
        assert!(check_requirements(&snap, &internal(), Some("2.13.0")).is_err());
        // Fresh installs have nothing to upgrade from
        assert!(check_requirements(&snap, &internal(), None).is_ok());
    }

    #[test]
    fn test_failed_report_message() {
        let report = PreflightReport::Failed {
            detail: "mysql version 5.7 does not meet the required 8.0.0".to_string(),
            retry_in: Duration::from_secs(600),
        };
        let condition = report.to_condition().unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(
            condition.message,
            "Preflights failed - mysql version 5.7 does not meet the required 8.0.0 - re-running preflights in 10 minutes"
        );
        assert!(PreflightReport::Disabled.to_condition().is_none());
    }

    #[tokio::test]
    async fn test_declared_probe_reads_external_versions() {
        let cr: APIManager = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps.apimanager.dev/v1alpha1",
            "kind": "APIManager",
            "metadata": {"name": "apimanager", "namespace": "api"},
            "spec": {
                "wildcardDomain": "example.com",
                "externalComponents": {
                    "systemDatabase": {"enabled": true, "engine": "postgresql", "version": "13.4"},
                    "backendRedis": {"enabled": true},
                },
            },
        }))
        .unwrap();
        let versions = DeclaredVersionProbe.versions(&cr).await.unwrap();
        assert_eq!(versions.mysql, None);
        assert_eq!(
            versions.postgres,
            Some(ProbedVersion::External(Some("13.4".to_string())))
        );
        assert_eq!(versions.backend_redis, ProbedVersion::External(None));
        assert_eq!(versions.system_redis, ProbedVersion::Internal);
    }
}
