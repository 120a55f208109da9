//! # Backup
//!
//! Copies an APIManager's configuration and system file storage into a claim.
//!
//! `Pending → MainStepsInProgress → MainStepsCompleted → CleanupInProgress → Completed`
//!
//! The source is the single APIManager living in the backup's namespace. It is recorded in
//! `status.apiManagerSourceName` by the first step and read back on every later pass.

use super::{
    build_job, job_name, permission_objects, rule, ClaimMount, EnsurePermissions, JobOrchestrator,
    JobTemplate, JobsCleanup, MarkCompleted, MarkMainStepsCompleted, Operation, OperationContext,
    RunJobs,
};
use crate::config::SharedOperatorConfig;
use crate::constants::API_GROUP;
use crate::controller::conditions::Clock;
use crate::controller::error::ReconcilerError;
use crate::controller::reconciler::builder::SYSTEM_STORAGE_PVC;
use crate::controller::reconciler::{backoff_key, Reconciler};
use crate::controller::steps::{ReconcileSignal, Step, StepOutcome, StepSequencer};
use crate::crd::{APIManager, APIManagerBackup, APIManagerBackupStatus, OperationMarkers};
use crate::observability;
use crate::store::{
    ensure, get_as, list_as, to_dynamic, update_status_as, ConvergenceClient, Desired, ObjectKey,
    SharedClient,
};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, Instrument};

const DEFAULT_BACKUP_STORAGE: &str = "2Gi";
const BACKUP_MOUNT: &str = "/backup";

const JOB_SECRETS_AND_CONFIGMAPS: &str = "backup-secrets-and-configmaps";
const JOB_APIMANAGER: &str = "backup-apimanager";
const JOB_SYSTEM_STORAGE: &str = "backup-system-storage";

impl Operation for APIManagerBackup {
    type Status = APIManagerBackupStatus;

    fn markers(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }

    fn markers_mut(&mut self) -> &mut Self::Status {
        self.status.get_or_insert_with(Default::default)
    }
}

/// Per-pass state of a backup
pub struct BackupContext {
    pub backup: APIManagerBackup,
    /// Source installation, once recorded
    pub source: Option<APIManager>,
    client: SharedClient,
    config: SharedOperatorConfig,
    clock: Arc<dyn Clock>,
    jobs: JobOrchestrator,
}

impl BackupContext {
    fn namespace(&self) -> Result<String, ReconcilerError> {
        self.backup
            .namespace()
            .ok_or(ReconcilerError::MissingObjectKey("metadata.namespace"))
    }

    fn identity(&self) -> String {
        format!("apimanager-backup-{}", self.backup.name_any())
    }

    fn claim_name(&self) -> String {
        self.backup
            .status
            .as_ref()
            .and_then(|s| s.backup_persistent_volume_claim_name.clone())
            .unwrap_or_else(|| self.backup.name_any())
    }

    fn source(&self) -> Result<&APIManager, ReconcilerError> {
        self.source.as_ref().ok_or_else(|| {
            ReconcilerError::Validation(format!(
                "source APIManager of backup {} is gone",
                self.backup.name_any()
            ))
        })
    }

    fn template(&self, prefix: &'static str, script: String) -> JobTemplate {
        JobTemplate {
            prefix,
            image: self.config.backup_job_image.clone(),
            service_account: self.identity(),
            script,
            mounts: vec![ClaimMount {
                volume: "backup",
                claim: self.claim_name(),
                mount_path: BACKUP_MOUNT,
                read_only: false,
            }],
        }
    }
}

impl OperationContext for BackupContext {
    type Op = APIManagerBackup;

    fn operation(&self) -> &APIManagerBackup {
        &self.backup
    }

    fn client(&self) -> &dyn ConvergenceClient {
        self.client.as_ref()
    }

    fn jobs(&self) -> &JobOrchestrator {
        &self.jobs
    }

    fn now(&self) -> String {
        self.clock.now_rfc3339()
    }

    fn permissions(&self) -> Result<Vec<Desired>, ReconcilerError> {
        permission_objects(
            &self.backup,
            &self.identity(),
            vec![
                rule("", &["secrets", "configmaps"], &["get", "list"]),
                rule(API_GROUP, &["apimanagers"], &["get", "list"]),
            ],
        )
    }

    fn job_keys(&self) -> Vec<ObjectKey> {
        let (Some(namespace), Some(uid)) = (self.backup.namespace(), self.backup.uid()) else {
            return Vec::new();
        };
        [JOB_SECRETS_AND_CONFIGMAPS, JOB_APIMANAGER, JOB_SYSTEM_STORAGE]
            .into_iter()
            .map(|prefix| ObjectKey::of::<Job>(&namespace, &job_name(prefix, &uid)))
            .collect()
    }
}

/// Jobs run by the `jobs` step, in order
fn job_plan(ctx: &BackupContext) -> Result<Vec<Job>, ReconcilerError> {
    let namespace = ctx.namespace()?;
    let source = ctx.source()?;
    let source_name = source.name_any();
    let mut plan = vec![
        build_job(
            &ctx.backup,
            ctx.template(
                JOB_SECRETS_AND_CONFIGMAPS,
                format!(
                    "kubectl get secrets,configmaps -n {namespace} -l app={} -o json > {BACKUP_MOUNT}/secrets-and-configmaps.json",
                    source.app_label()
                ),
            ),
        )?,
        build_job(
            &ctx.backup,
            ctx.template(
                JOB_APIMANAGER,
                format!(
                    "kubectl get apimanager {source_name} -n {namespace} -o json > {BACKUP_MOUNT}/apimanager.json"
                ),
            ),
        )?,
    ];
    if source.system_storage_is_pvc() {
        let mut template = ctx.template(
            JOB_SYSTEM_STORAGE,
            format!("mkdir -p {BACKUP_MOUNT}/system-storage && cp -a /system-storage/. {BACKUP_MOUNT}/system-storage/"),
        );
        template.mounts.push(ClaimMount {
            volume: "system-storage",
            claim: SYSTEM_STORAGE_PVC.to_string(),
            mount_path: "/system-storage",
            read_only: true,
        });
        plan.push(build_job(&ctx.backup, template)?);
    }
    Ok(plan)
}

/// Records the start time and the source APIManager
struct StartTime;

#[async_trait]
impl Step<BackupContext> for StartTime {
    fn name(&self) -> &'static str {
        "start-time"
    }

    async fn run(&self, ctx: &mut BackupContext) -> Result<StepOutcome, ReconcilerError> {
        if ctx.backup.start_time().is_some() {
            return Ok(StepOutcome::Continue);
        }
        let namespace = ctx.namespace()?;
        let candidates = list_as::<APIManager>(ctx.client(), Some(&namespace), None).await?;
        let [source] = candidates.as_slice() else {
            return Err(ReconcilerError::Validation(format!(
                "backup needs exactly one APIManager in namespace {namespace}, found {}",
                candidates.len()
            )));
        };

        let mut backup = ctx.backup.clone();
        let status = backup.markers_mut();
        status.set_start_time(ctx.now());
        status.api_manager_source_name = Some(source.name_any());
        update_status_as(ctx.client(), &backup).await?;
        info!("📅 Backup {} of APIManager {} started", backup.name_any(), source.name_any());
        Ok(StepOutcome::Requeue(None))
    }
}

/// Creates the destination claim and records its name
struct DestinationClaim;

#[async_trait]
impl Step<BackupContext> for DestinationClaim {
    fn name(&self) -> &'static str {
        "destination-claim"
    }

    async fn run(&self, ctx: &mut BackupContext) -> Result<StepOutcome, ReconcilerError> {
        let recorded = ctx
            .backup
            .status
            .as_ref()
            .and_then(|s| s.backup_persistent_volume_claim_name.as_ref());
        if recorded.is_some() {
            return Ok(StepOutcome::Continue);
        }

        let destination = ctx
            .backup
            .spec
            .backup_destination
            .persistent_volume_claim
            .clone()
            .ok_or_else(|| {
                ReconcilerError::Validation(
                    "backupDestination.persistentVolumeClaim is required".to_string(),
                )
            })?;
        let owner = ctx
            .backup
            .controller_owner_ref(&())
            .ok_or(ReconcilerError::MissingObjectKey("metadata.uid"))?;
        let storage = destination
            .resources
            .map(|r| r.storage)
            .unwrap_or_else(|| DEFAULT_BACKUP_STORAGE.to_string());
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(ctx.backup.name_any()),
                namespace: Some(ctx.namespace()?),
                owner_references: Some(vec![owner]),
                ..ObjectMeta::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                volume_name: destination.volume_name,
                storage_class_name: destination.storage_class,
                resources: Some(VolumeResourceRequirements {
                    requests: Some([("storage".to_string(), Quantity(storage))].into()),
                    ..VolumeResourceRequirements::default()
                }),
                ..PersistentVolumeClaimSpec::default()
            }),
            ..PersistentVolumeClaim::default()
        };
        ensure(ctx.client(), Desired::create_only(to_dynamic(&claim)?)).await?;

        let mut backup = ctx.backup.clone();
        let claim_name = backup.name_any();
        backup.markers_mut().backup_persistent_volume_claim_name = Some(claim_name);
        update_status_as(ctx.client(), &backup).await?;
        Ok(StepOutcome::Requeue(None))
    }
}

fn main_steps() -> Result<StepSequencer<BackupContext>, ReconcilerError> {
    Ok(StepSequencer::builder()
        .step(StartTime)
        .step(DestinationClaim)
        .step(EnsurePermissions)
        .step(RunJobs::new("jobs", job_plan))
        .step(MarkMainStepsCompleted)
        .build()?)
}

fn post_steps() -> Result<StepSequencer<BackupContext>, ReconcilerError> {
    Ok(StepSequencer::builder()
        .step(JobsCleanup)
        .step(MarkCompleted)
        .build()?)
}

/// Controller entry point
pub async fn reconcile_backup(
    backup: Arc<APIManagerBackup>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let name = backup.name_any();
    let namespace = backup
        .namespace()
        .ok_or(ReconcilerError::MissingObjectKey("metadata.namespace"))?;
    let span = info_span!(
        "backup.reconcile",
        resource.name = %name,
        resource.namespace = %namespace,
        resource.kind = "APIManagerBackup"
    );
    let start = Instant::now();
    observability::metrics::increment_reconciliations_total("backup");

    let result = reconcile_backup_pass(&ctx, &namespace, &name)
        .instrument(span)
        .await;
    observability::metrics::observe_reconciliation_duration("backup", start.elapsed().as_secs_f64());

    let signal = result?;
    ctx.reset_backoff(&backoff_key("APIManagerBackup", &namespace, &name));
    Ok(signal.into_action())
}

/// One pass over the backup `namespace/name`
pub async fn reconcile_backup_pass(
    reconciler: &Reconciler,
    namespace: &str,
    name: &str,
) -> Result<ReconcileSignal, ReconcilerError> {
    let client = reconciler.client.as_ref();
    let Some(backup) = get_as::<APIManagerBackup>(client, namespace, name).await? else {
        debug!("APIManagerBackup {namespace}/{name} is gone");
        return Ok(ReconcileSignal::done());
    };
    if backup.completed() {
        debug!("APIManagerBackup {namespace}/{name} already completed");
        return Ok(ReconcileSignal::done());
    }

    let source = match backup
        .status
        .as_ref()
        .and_then(|s| s.api_manager_source_name.as_deref())
    {
        Some(source) => get_as::<APIManager>(client, namespace, source).await?,
        None => None,
    };
    let main_completed = backup.main_steps_completed();
    let mut ctx = BackupContext {
        backup,
        source,
        client: reconciler.client.clone(),
        config: reconciler.config.clone(),
        clock: reconciler.clock.clone(),
        jobs: JobOrchestrator::new(reconciler.client.clone(), reconciler.config.job_poll_interval()),
    };

    let sequencer = if main_completed {
        post_steps()?
    } else {
        main_steps()?
    };
    sequencer.run(&mut ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequences_are_well_formed() {
        assert_eq!(
            main_steps().unwrap().names(),
            vec!["start-time", "destination-claim", "permissions", "jobs", "main-steps-completed"]
        );
        assert_eq!(post_steps().unwrap().names(), vec!["jobs-cleanup", "completed"]);
    }
}
