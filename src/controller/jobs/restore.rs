//! # Restore
//!
//! Rebuilds an APIManager from a claim filled by a backup.
//!
//! The saved APIManager is copied out of the claim by a job into a secret shared with the
//! operator. The operator parses it, restores file storage when the saved installation used a
//! claim, creates the APIManager and waits for it to become available before resyncing the
//! integration service's domains.

use super::{
    build_job, job_name, permission_objects, rule, ClaimMount, EnsurePermissions, JobOrchestrator,
    JobProgress, JobTemplate, JobsCleanup, MarkCompleted, MarkMainStepsCompleted, Operation,
    OperationContext, RunJobs,
};
use crate::config::SharedOperatorConfig;
use crate::constants::API_GROUP;
use crate::controller::conditions::Clock;
use crate::controller::error::ReconcilerError;
use crate::controller::reconciler::builder::{system_storage_claim_spec, SYSTEM_STORAGE_PVC};
use crate::controller::reconciler::{backoff_key, Reconciler};
use crate::controller::steps::{ReconcileSignal, Step, StepOutcome, StepSequencer};
use crate::crd::{APIManager, APIManagerRestore, APIManagerRestoreStatus, OperationMarkers};
use crate::observability;
use crate::store::{
    ensure, get_as, to_dynamic, update_status_as, ConvergenceClient, Desired, ObjectKey,
    PropagationPolicy, SharedClient,
};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, Instrument};

const BACKUP_MOUNT: &str = "/backup";
/// Key of the saved APIManager inside the shared secret
pub const SAVED_APIMANAGER_KEY: &str = "apimanager.json";

const JOB_SECRETS_AND_CONFIGMAPS: &str = "restore-secrets-and-configmaps";
const JOB_APIMANAGER: &str = "restore-apimanager";
const JOB_SYSTEM_STORAGE: &str = "restore-system-storage";
const JOB_RESYNC_DOMAINS: &str = "restore-resync-domains";

impl Operation for APIManagerRestore {
    type Status = APIManagerRestoreStatus;

    fn markers(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }

    fn markers_mut(&mut self) -> &mut Self::Status {
        self.status.get_or_insert_with(Default::default)
    }
}

/// Name of the secret the restore-apimanager job writes the saved APIManager into
pub fn shared_secret_name(restore: &APIManagerRestore) -> String {
    format!("apimanager-restore-{}", restore.name_any())
}

/// Parse the saved APIManager out of the shared secret
pub fn saved_apimanager(secret: &Secret) -> Result<Option<APIManager>, ReconcilerError> {
    let Some(raw) = secret
        .data
        .as_ref()
        .and_then(|data| data.get(SAVED_APIMANAGER_KEY))
    else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_slice(&raw.0)?))
}

/// The saved APIManager stripped of server-owned fields, placed in `namespace`
pub fn restored_apimanager(saved: &APIManager, namespace: &str) -> APIManager {
    APIManager {
        metadata: ObjectMeta {
            name: saved.metadata.name.clone(),
            namespace: Some(namespace.to_string()),
            labels: saved.metadata.labels.clone(),
            annotations: saved.metadata.annotations.clone(),
            ..ObjectMeta::default()
        },
        spec: saved.spec.clone(),
        status: None,
    }
}

/// Per-pass state of a restore
pub struct RestoreContext {
    pub restore: APIManagerRestore,
    /// Saved APIManager, once the shared secret exists
    pub saved: Option<APIManager>,
    client: SharedClient,
    config: SharedOperatorConfig,
    clock: Arc<dyn Clock>,
    jobs: JobOrchestrator,
}

impl RestoreContext {
    fn namespace(&self) -> Result<String, ReconcilerError> {
        self.restore
            .namespace()
            .ok_or(ReconcilerError::MissingObjectKey("metadata.namespace"))
    }

    fn identity(&self) -> String {
        format!("apimanager-restore-{}", self.restore.name_any())
    }

    fn saved(&self) -> Result<&APIManager, ReconcilerError> {
        self.saved.as_ref().ok_or_else(|| {
            ReconcilerError::Validation(format!(
                "secret {} does not hold a saved APIManager",
                shared_secret_name(&self.restore)
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
                claim: self
                    .restore
                    .spec
                    .restore_source
                    .persistent_volume_claim
                    .claim_source
                    .claim_name
                    .clone(),
                mount_path: BACKUP_MOUNT,
                read_only: true,
            }],
        }
    }
}

impl OperationContext for RestoreContext {
    type Op = APIManagerRestore;

    fn operation(&self) -> &APIManagerRestore {
        &self.restore
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
            &self.restore,
            &self.identity(),
            vec![
                rule(
                    "",
                    &["secrets", "configmaps"],
                    &["get", "list", "create", "update", "patch"],
                ),
                rule("", &["pods"], &["get", "list"]),
                rule("", &["pods/exec"], &["create"]),
                rule("apps", &["deployments"], &["get"]),
                rule(API_GROUP, &["apimanagers"], &["get", "list"]),
            ],
        )
    }

    fn job_keys(&self) -> Vec<ObjectKey> {
        let (Some(namespace), Some(uid)) = (self.restore.namespace(), self.restore.uid()) else {
            return Vec::new();
        };
        [
            JOB_SECRETS_AND_CONFIGMAPS,
            JOB_APIMANAGER,
            JOB_SYSTEM_STORAGE,
            JOB_RESYNC_DOMAINS,
        ]
        .into_iter()
        .map(|prefix| ObjectKey::of::<Job>(&namespace, &job_name(prefix, &uid)))
        .collect()
    }
}

fn secrets_and_configmaps_job(ctx: &RestoreContext) -> Result<Vec<Job>, ReconcilerError> {
    let namespace = ctx.namespace()?;
    Ok(vec![build_job(
        &ctx.restore,
        ctx.template(
            JOB_SECRETS_AND_CONFIGMAPS,
            format!("kubectl apply -n {namespace} -f {BACKUP_MOUNT}/secrets-and-configmaps.json"),
        ),
    )?])
}

fn apimanager_job(ctx: &RestoreContext) -> Result<Vec<Job>, ReconcilerError> {
    let namespace = ctx.namespace()?;
    let secret = shared_secret_name(&ctx.restore);
    Ok(vec![build_job(
        &ctx.restore,
        ctx.template(
            JOB_APIMANAGER,
            format!(
                "kubectl create secret generic {secret} -n {namespace} --from-file={SAVED_APIMANAGER_KEY}={BACKUP_MOUNT}/apimanager.json --dry-run=client -o json | kubectl apply -f -"
            ),
        ),
    )?])
}

fn resync_domains_job(ctx: &RestoreContext) -> Result<Vec<Job>, ReconcilerError> {
    let namespace = ctx.namespace()?;
    Ok(vec![build_job(
        &ctx.restore,
        ctx.template(
            JOB_RESYNC_DOMAINS,
            format!(
                "kubectl exec -n {namespace} deployment/system-sidekiq -- bundle exec rake zync:resync:domains"
            ),
        ),
    )?])
}

struct StartTime;

#[async_trait]
impl Step<RestoreContext> for StartTime {
    fn name(&self) -> &'static str {
        "start-time"
    }

    async fn run(&self, ctx: &mut RestoreContext) -> Result<StepOutcome, ReconcilerError> {
        if ctx.restore.start_time().is_some() {
            return Ok(StepOutcome::Continue);
        }
        let mut restore = ctx.restore.clone();
        restore.markers_mut().set_start_time(ctx.now());
        update_status_as(ctx.client(), &restore).await?;
        info!("📅 Restore {} started", restore.name_any());
        Ok(StepOutcome::Requeue(None))
    }
}

/// Records which APIManager the saved one will become
struct RecordTarget;

#[async_trait]
impl Step<RestoreContext> for RecordTarget {
    fn name(&self) -> &'static str {
        "record-apimanager"
    }

    async fn run(&self, ctx: &mut RestoreContext) -> Result<StepOutcome, ReconcilerError> {
        let recorded = ctx
            .restore
            .status
            .as_ref()
            .and_then(|s| s.api_manager_to_restore_ref.as_ref());
        if recorded.is_some() {
            return Ok(StepOutcome::Continue);
        }
        let target = ctx.saved()?.name_any();
        let mut restore = ctx.restore.clone();
        restore.markers_mut().api_manager_to_restore_ref = Some(target.clone());
        update_status_as(ctx.client(), &restore).await?;
        info!("Restoring APIManager {target}");
        Ok(StepOutcome::Requeue(None))
    }
}

/// Recreates the system file storage claim and fills it, when the saved installation used one
struct SystemStorage;

#[async_trait]
impl Step<RestoreContext> for SystemStorage {
    fn name(&self) -> &'static str {
        "system-storage"
    }

    async fn run(&self, ctx: &mut RestoreContext) -> Result<StepOutcome, ReconcilerError> {
        let saved = ctx.saved()?;
        if !saved.system_storage_is_pvc() {
            return Ok(StepOutcome::Continue);
        }
        let storage_class = saved
            .system_file_storage()
            .and_then(|storage| storage.persistent_volume_claim.as_ref())
            .and_then(|pvc| pvc.storage_class_name.clone());

        // Not owned by the restore: the claim outlives it and is adopted by the APIManager
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(SYSTEM_STORAGE_PVC.to_string()),
                namespace: Some(ctx.namespace()?),
                ..ObjectMeta::default()
            },
            spec: Some(system_storage_claim_spec(storage_class)),
            ..PersistentVolumeClaim::default()
        };
        if ensure(ctx.client(), Desired::create_only(to_dynamic(&claim)?))
            .await?
            .wrote()
        {
            return Ok(StepOutcome::Requeue(None));
        }

        let mut template = ctx.template(
            JOB_SYSTEM_STORAGE,
            format!("cp -a {BACKUP_MOUNT}/system-storage/. /system-storage/"),
        );
        template.mounts.push(ClaimMount {
            volume: "system-storage",
            claim: SYSTEM_STORAGE_PVC.to_string(),
            mount_path: "/system-storage",
            read_only: false,
        });
        let job = build_job(&ctx.restore, template)?;
        match ctx.jobs().poll(&job).await? {
            JobProgress::Succeeded => Ok(StepOutcome::Continue),
            _ => Ok(StepOutcome::requeue_after(ctx.jobs().poll_interval())),
        }
    }
}

struct CreateApiManager;

#[async_trait]
impl Step<RestoreContext> for CreateApiManager {
    fn name(&self) -> &'static str {
        "create-apimanager"
    }

    async fn run(&self, ctx: &mut RestoreContext) -> Result<StepOutcome, ReconcilerError> {
        let restored = restored_apimanager(ctx.saved()?, &ctx.namespace()?);
        let outcome = ensure(ctx.client(), Desired::create_only(to_dynamic(&restored)?)).await?;
        Ok(if outcome.wrote() {
            StepOutcome::Requeue(None)
        } else {
            StepOutcome::Continue
        })
    }
}

struct WaitAvailable;

#[async_trait]
impl Step<RestoreContext> for WaitAvailable {
    fn name(&self) -> &'static str {
        "wait-available"
    }

    async fn run(&self, ctx: &mut RestoreContext) -> Result<StepOutcome, ReconcilerError> {
        let target = ctx.saved()?.name_any();
        let apimanager = get_as::<APIManager>(ctx.client(), &ctx.namespace()?, &target).await?;
        let available = apimanager
            .and_then(|a| a.status)
            .is_some_and(|status| status.is_available());
        if available {
            Ok(StepOutcome::Continue)
        } else {
            debug!("Waiting for APIManager {target} to become available");
            Ok(StepOutcome::requeue_after(ctx.jobs().poll_interval()))
        }
    }
}

/// Removes the secret holding the saved APIManager
struct SharedSecretCleanup;

#[async_trait]
impl Step<RestoreContext> for SharedSecretCleanup {
    fn name(&self) -> &'static str {
        "secret-cleanup"
    }

    async fn run(&self, ctx: &mut RestoreContext) -> Result<StepOutcome, ReconcilerError> {
        let key = ObjectKey::of::<Secret>(&ctx.namespace()?, &shared_secret_name(&ctx.restore));
        ensure(
            ctx.client(),
            Desired::Absent {
                key,
                policy: PropagationPolicy::Background,
            },
        )
        .await?;
        Ok(StepOutcome::Continue)
    }
}

fn main_steps() -> Result<StepSequencer<RestoreContext>, ReconcilerError> {
    Ok(StepSequencer::builder()
        .step(StartTime)
        .step(EnsurePermissions)
        .step(RunJobs::new(JOB_SECRETS_AND_CONFIGMAPS, secrets_and_configmaps_job))
        .step(RunJobs::new(JOB_APIMANAGER, apimanager_job))
        .step(RecordTarget)
        .step(SystemStorage)
        .step(CreateApiManager)
        .step(WaitAvailable)
        .step(RunJobs::new(JOB_RESYNC_DOMAINS, resync_domains_job))
        .step(MarkMainStepsCompleted)
        .build()?)
}

fn post_steps() -> Result<StepSequencer<RestoreContext>, ReconcilerError> {
    Ok(StepSequencer::builder()
        .step(JobsCleanup)
        .step(SharedSecretCleanup)
        .step(MarkCompleted)
        .build()?)
}

/// Controller entry point
pub async fn reconcile_restore(
    restore: Arc<APIManagerRestore>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let name = restore.name_any();
    let namespace = restore
        .namespace()
        .ok_or(ReconcilerError::MissingObjectKey("metadata.namespace"))?;
    let span = info_span!(
        "restore.reconcile",
        resource.name = %name,
        resource.namespace = %namespace,
        resource.kind = "APIManagerRestore"
    );
    let start = Instant::now();
    observability::metrics::increment_reconciliations_total("restore");

    let result = reconcile_restore_pass(&ctx, &namespace, &name)
        .instrument(span)
        .await;
    observability::metrics::observe_reconciliation_duration("restore", start.elapsed().as_secs_f64());

    let signal = result?;
    ctx.reset_backoff(&backoff_key("APIManagerRestore", &namespace, &name));
    Ok(signal.into_action())
}

/// One pass over the restore `namespace/name`
pub async fn reconcile_restore_pass(
    reconciler: &Reconciler,
    namespace: &str,
    name: &str,
) -> Result<ReconcileSignal, ReconcilerError> {
    let client = reconciler.client.as_ref();
    let Some(restore) = get_as::<APIManagerRestore>(client, namespace, name).await? else {
        debug!("APIManagerRestore {namespace}/{name} is gone");
        return Ok(ReconcileSignal::done());
    };
    if restore.completed() {
        debug!("APIManagerRestore {namespace}/{name} already completed");
        return Ok(ReconcileSignal::done());
    }

    let saved = match get_as::<Secret>(client, namespace, &shared_secret_name(&restore)).await? {
        Some(secret) => saved_apimanager(&secret)?,
        None => None,
    };
    let main_completed = restore.main_steps_completed();
    let mut ctx = RestoreContext {
        restore,
        saved,
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
