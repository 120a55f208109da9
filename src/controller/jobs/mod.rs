//! # Job Orchestrator
//!
//! Resumable multi-step operations built from one-shot batch jobs.
//!
//! Backup and restore share this engine. Progress lives only in the operation's status
//! markers and in the jobs themselves, so a restarted operator resumes where the last one
//! stopped:
//!
//! - a job is created once and never mutated; it is polled until `succeeded == completions`
//! - `failed > 0` is logged and polling continues, the job's own retry policy applies
//! - jobs are deleted with foreground propagation during cleanup, before `completed` is set

pub mod backup;
mod permissions;
pub mod restore;

pub use permissions::{permission_objects, rule};

use crate::controller::error::ReconcilerError;
use crate::controller::steps::{Step, StepOutcome};
use crate::crd::OperationMarkers;
use crate::observability;
use crate::store::{
    ensure, get_as, to_dynamic, update_status_as, ConvergenceClient, Desired, ObjectKey,
    PropagationPolicy, SharedClient,
};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Observed state of one planned job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobProgress {
    /// Created during this call
    Created,
    Running {
        active: i32,
        failed: i32,
        succeeded: i32,
    },
    Succeeded,
}

/// Result of a cleanup pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupProgress {
    /// This many jobs were still present and have been asked to go away
    Pending(usize),
    Clear,
}

/// Deterministic job name for an operation
pub fn job_name(prefix: &str, uid: &str) -> String {
    format!("{prefix}-{uid}")
}

/// Creates, polls and cleans up batch jobs
#[derive(Clone)]
pub struct JobOrchestrator {
    client: SharedClient,
    poll_interval: Duration,
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl JobOrchestrator {
    pub fn new(client: SharedClient, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Create `job` if it is absent, otherwise report its progress
    pub async fn poll(&self, job: &Job) -> Result<JobProgress, ReconcilerError> {
        let name = job.name_any();
        let namespace = job
            .namespace()
            .ok_or(ReconcilerError::MissingObjectKey("metadata.namespace"))?;

        let Some(existing) = get_as::<Job>(self.client.as_ref(), &namespace, &name).await? else {
            match self.client.create(&to_dynamic(job)?).await {
                Ok(_) => {
                    info!("✅ Created job {namespace}/{name}");
                    observability::metrics::increment_jobs_launched_total();
                    return Ok(JobProgress::Created);
                }
                Err(e) if e.is_already_exists() => {
                    debug!("Job {namespace}/{name} already exists");
                    return Ok(JobProgress::Running {
                        active: 0,
                        failed: 0,
                        succeeded: 0,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        };

        let completions = existing
            .spec
            .as_ref()
            .and_then(|spec| spec.completions)
            .unwrap_or(1);
        let status = existing.status.unwrap_or_default();
        let succeeded = status.succeeded.unwrap_or(0);
        let failed = status.failed.unwrap_or(0);
        if succeeded >= completions {
            return Ok(JobProgress::Succeeded);
        }
        if failed > 0 {
            warn!("Job {namespace}/{name} has {failed} failed pod(s), waiting for retries");
        }
        Ok(JobProgress::Running {
            active: status.active.unwrap_or(0),
            failed,
            succeeded,
        })
    }

    /// Foreground-delete every present job in `keys`
    pub async fn cleanup(&self, keys: &[ObjectKey]) -> Result<CleanupProgress, ReconcilerError> {
        let mut pending = 0;
        for key in keys {
            let outcome = ensure(
                self.client.as_ref(),
                Desired::Absent {
                    key: key.clone(),
                    policy: PropagationPolicy::Foreground,
                },
            )
            .await?;
            if outcome.wrote() {
                pending += 1;
            }
        }
        Ok(if pending == 0 {
            CleanupProgress::Clear
        } else {
            CleanupProgress::Pending(pending)
        })
    }
}

/// A claim mounted into a job pod
#[derive(Debug, Clone)]
pub struct ClaimMount {
    pub volume: &'static str,
    pub claim: String,
    pub mount_path: &'static str,
    pub read_only: bool,
}

/// Everything that varies between the jobs of an operation
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub prefix: &'static str,
    pub image: String,
    pub service_account: String,
    pub script: String,
    pub mounts: Vec<ClaimMount>,
}

/// Render a single-completion job owned by `owner`
pub fn build_job<O: Operation>(owner: &O, template: JobTemplate) -> Result<Job, ReconcilerError> {
    let uid = owner
        .meta()
        .uid
        .as_deref()
        .ok_or(ReconcilerError::MissingObjectKey("metadata.uid"))?;
    let owner_ref = owner
        .controller_owner_ref(&())
        .ok_or(ReconcilerError::MissingObjectKey("metadata.uid"))?;

    let volumes = template
        .mounts
        .iter()
        .map(|mount| Volume {
            name: mount.volume.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: mount.claim.clone(),
                read_only: Some(mount.read_only),
            }),
            ..Volume::default()
        })
        .collect();
    let volume_mounts = template
        .mounts
        .iter()
        .map(|mount| VolumeMount {
            name: mount.volume.to_string(),
            mount_path: mount.mount_path.to_string(),
            read_only: Some(mount.read_only),
            ..VolumeMount::default()
        })
        .collect();

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(job_name(template.prefix, uid)),
            namespace: owner.namespace(),
            labels: Some([("app".to_string(), "apimanager".to_string())].into()),
            owner_references: Some(vec![owner_ref]),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            completions: Some(1),
            backoff_limit: Some(3),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    service_account_name: Some(template.service_account),
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: template.prefix.to_string(),
                        image: Some(template.image),
                        command: Some(vec![
                            "/bin/sh".to_string(),
                            "-c".to_string(),
                            template.script,
                        ]),
                        volume_mounts: Some(volume_mounts),
                        ..Container::default()
                    }],
                    volumes: Some(volumes),
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        ..Job::default()
    })
}

/// A custom resource driven by the job orchestrator
pub trait Operation:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Status: OperationMarkers + Default + Send + Sync;

    fn markers(&self) -> Option<&Self::Status>;

    fn markers_mut(&mut self) -> &mut Self::Status;

    fn start_time(&self) -> Option<&str> {
        self.markers().and_then(OperationMarkers::start_time)
    }

    fn main_steps_completed(&self) -> bool {
        self.markers()
            .is_some_and(OperationMarkers::main_steps_completed)
    }

    fn completed(&self) -> bool {
        self.markers().is_some_and(OperationMarkers::completed)
    }
}

/// State a backup or restore pass threads through its steps
pub trait OperationContext: Send + Sync {
    type Op: Operation;

    fn operation(&self) -> &Self::Op;

    fn client(&self) -> &dyn ConvergenceClient;

    fn jobs(&self) -> &JobOrchestrator;

    fn now(&self) -> String;

    /// ServiceAccount, Role and RoleBinding the jobs run as
    fn permissions(&self) -> Result<Vec<Desired>, ReconcilerError>;

    /// Every job the operation may have created
    fn job_keys(&self) -> Vec<ObjectKey>;
}

async fn persist<O: Operation>(client: &dyn ConvergenceClient, op: &O) -> Result<(), ReconcilerError> {
    update_status_as(client, op).await?;
    Ok(())
}

/// Ensures the job identity; requeues while anything had to be created
#[derive(Debug, Clone, Copy, Default)]
pub struct EnsurePermissions;

#[async_trait]
impl<C: OperationContext> Step<C> for EnsurePermissions {
    fn name(&self) -> &'static str {
        "permissions"
    }

    async fn run(&self, ctx: &mut C) -> Result<StepOutcome, ReconcilerError> {
        let mut created = false;
        for desired in ctx.permissions()? {
            created |= ensure(ctx.client(), desired).await?.wrote();
        }
        Ok(if created {
            StepOutcome::Requeue(None)
        } else {
            StepOutcome::Continue
        })
    }
}

/// Runs planned jobs one after another
pub struct RunJobs<C> {
    name: &'static str,
    plan: fn(&C) -> Result<Vec<Job>, ReconcilerError>,
}

impl<C> RunJobs<C> {
    pub fn new(name: &'static str, plan: fn(&C) -> Result<Vec<Job>, ReconcilerError>) -> Self {
        Self { name, plan }
    }
}

#[async_trait]
impl<C: OperationContext> Step<C> for RunJobs<C> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, ctx: &mut C) -> Result<StepOutcome, ReconcilerError> {
        for job in (self.plan)(ctx)? {
            match ctx.jobs().poll(&job).await? {
                JobProgress::Succeeded => continue,
                JobProgress::Created | JobProgress::Running { .. } => {
                    return Ok(StepOutcome::requeue_after(ctx.jobs().poll_interval()));
                }
            }
        }
        Ok(StepOutcome::Continue)
    }
}

/// Sets `mainStepsCompleted`
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkMainStepsCompleted;

#[async_trait]
impl<C: OperationContext> Step<C> for MarkMainStepsCompleted {
    fn name(&self) -> &'static str {
        "main-steps-completed"
    }

    async fn run(&self, ctx: &mut C) -> Result<StepOutcome, ReconcilerError> {
        if ctx.operation().main_steps_completed() {
            return Ok(StepOutcome::Continue);
        }
        let mut op = ctx.operation().clone();
        op.markers_mut().set_main_steps_completed();
        persist(ctx.client(), &op).await?;
        info!("✅ Main steps of {} completed", op.name_any());
        Ok(StepOutcome::Requeue(None))
    }
}

/// Deletes every job of the operation; requeues until none is left
#[derive(Debug, Clone, Copy, Default)]
pub struct JobsCleanup;

#[async_trait]
impl<C: OperationContext> Step<C> for JobsCleanup {
    fn name(&self) -> &'static str {
        "jobs-cleanup"
    }

    async fn run(&self, ctx: &mut C) -> Result<StepOutcome, ReconcilerError> {
        if ctx.operation().completed() {
            return Ok(StepOutcome::Continue);
        }
        match ctx.jobs().cleanup(&ctx.job_keys()).await? {
            CleanupProgress::Clear => Ok(StepOutcome::Continue),
            CleanupProgress::Pending(n) => {
                info!("🗑️ Waiting for {n} job(s) to be removed");
                Ok(StepOutcome::requeue_after(ctx.jobs().poll_interval()))
            }
        }
    }
}

/// Sets `completed` and `completionTime`
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkCompleted;

#[async_trait]
impl<C: OperationContext> Step<C> for MarkCompleted {
    fn name(&self) -> &'static str {
        "completed"
    }

    async fn run(&self, ctx: &mut C) -> Result<StepOutcome, ReconcilerError> {
        if ctx.operation().completed() {
            return Ok(StepOutcome::Continue);
        }
        let mut op = ctx.operation().clone();
        op.markers_mut().set_completed(ctx.now());
        persist(ctx.client(), &op).await?;
        info!("✅ {} {} completed", <C::Op as Resource>::kind(&()), op.name_any());
        Ok(StepOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::sync::Arc;

    fn job(name: &str, completions: Option<i32>) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("api".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(JobSpec {
                completions,
                ..JobSpec::default()
            }),
            ..Job::default()
        }
    }

    #[tokio::test]
    async fn test_poll_creates_once_then_tracks_completion() {
        let store = Arc::new(InMemoryStore::new());
        let jobs = JobOrchestrator::new(store.clone(), Duration::from_secs(5));
        let planned = job("backup-secrets-uid", None);

        assert_eq!(jobs.poll(&planned).await.unwrap(), JobProgress::Created);
        assert!(matches!(
            jobs.poll(&planned).await.unwrap(),
            JobProgress::Running { succeeded: 0, .. }
        ));

        let key = ObjectKey::of::<Job>("api", "backup-secrets-uid");
        store.set_status(&key, serde_json::json!({"failed": 2}));
        assert!(matches!(
            jobs.poll(&planned).await.unwrap(),
            JobProgress::Running { failed: 2, .. }
        ));

        store.set_status(&key, serde_json::json!({"succeeded": 1, "failed": 2}));
        assert_eq!(jobs.poll(&planned).await.unwrap(), JobProgress::Succeeded);
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_reports_pending_then_clear() {
        let store = Arc::new(InMemoryStore::new());
        let jobs = JobOrchestrator::new(store.clone(), Duration::from_secs(5));
        jobs.poll(&job("a", Some(1))).await.unwrap();
        let keys = vec![
            ObjectKey::of::<Job>("api", "a"),
            ObjectKey::of::<Job>("api", "b"),
        ];
        assert_eq!(jobs.cleanup(&keys).await.unwrap(), CleanupProgress::Pending(1));
        assert_eq!(jobs.cleanup(&keys).await.unwrap(), CleanupProgress::Clear);
    }

    #[test]
    fn test_job_name_is_deterministic() {
        assert_eq!(job_name("backup-apimanager", "1234"), "backup-apimanager-1234");
    }
}
