//! APIManagerBackup passes against the in-memory store

mod common;

use apimanager_operator::controller::jobs::backup::reconcile_backup_pass;
use apimanager_operator::controller::jobs::job_name;
use apimanager_operator::controller::reconciler::Reconciler;
use apimanager_operator::crd::{APIManager, APIManagerBackup};
use apimanager_operator::store::{list_as, InMemoryStore, ObjectKey, WriteOp};
use common::{apimanager, config, reconciler, NAMESPACE};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use std::sync::Arc;

fn source() -> APIManager {
    let mut source = apimanager("production");
    source.spec = serde_json::from_value(serde_json::json!({
        "wildcardDomain": "apps.example.com",
        "system": {"fileStorage": {"persistentVolumeClaim": {}}},
    }))
    .unwrap();
    source
}

fn backup(name: &str) -> APIManagerBackup {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "apps.apimanager.dev/v1alpha1",
        "kind": "APIManagerBackup",
        "metadata": {"name": name, "namespace": NAMESPACE},
        "spec": {"backupDestination": {"persistentVolumeClaim": {
            "resources": {"storage": "5Gi"},
        }}},
    }))
    .unwrap()
}

async fn jobs(store: &InMemoryStore) -> Vec<Job> {
    list_as::<Job>(store, Some(NAMESPACE), None).await.unwrap()
}

async fn succeed_jobs(store: &InMemoryStore) {
    for job in jobs(store).await {
        store.set_status(
            &ObjectKey::of::<Job>(NAMESPACE, &job.name_any()),
            serde_json::json!({"succeeded": 1}),
        );
    }
}

/// Run passes until the backup stops asking to be requeued
async fn drive(store: &InMemoryStore, reconciler: &Reconciler, name: &str) -> Vec<String> {
    let mut launched = Vec::new();
    for _ in 0..20 {
        let signal = reconcile_backup_pass(reconciler, NAMESPACE, name)
            .await
            .unwrap();

        let current = store.typed::<APIManagerBackup>(NAMESPACE, name).unwrap();
        let status = current.status.clone().unwrap_or_default();
        if status.completed == Some(true) {
            assert!(jobs(store).await.is_empty(), "completed with jobs left");
            assert_eq!(status.main_steps_completed, Some(true));
        }

        for job in jobs(store).await {
            if !launched.contains(&job.name_any()) {
                launched.push(job.name_any());
            }
        }
        succeed_jobs(store).await;
        if !signal.requeue {
            break;
        }
    }
    launched
}

#[tokio::test]
async fn test_backup_runs_jobs_then_cleans_up() {
    let store = Arc::new(InMemoryStore::new());
    let reconciler = reconciler(&store, config());
    store.seed_typed(&source()).unwrap();
    store.seed_typed(&backup("nightly")).unwrap();

    let launched = drive(&store, &reconciler, "nightly").await;
    assert_eq!(launched.len(), 3, "{launched:?}");
    assert!(launched[0].starts_with("backup-secrets-and-configmaps-"));
    assert!(launched[1].starts_with("backup-apimanager-"));
    assert!(launched[2].starts_with("backup-system-storage-"));

    let finished = store.typed::<APIManagerBackup>(NAMESPACE, "nightly").unwrap();
    let status = finished.status.unwrap();
    assert_eq!(status.completed, Some(true));
    assert_eq!(status.api_manager_source_name.as_deref(), Some("production"));
    assert_eq!(
        status.backup_persistent_volume_claim_name.as_deref(),
        Some("nightly")
    );
    assert!(status.start_time.is_some());
    assert!(status.completion_time.is_some());

    let claim = store
        .typed::<PersistentVolumeClaim>(NAMESPACE, "nightly")
        .unwrap();
    assert_eq!(
        claim.owner_references()[0].uid,
        finished.metadata.uid.unwrap()
    );
    assert!(jobs(&store).await.is_empty());
}

#[tokio::test]
async fn test_completed_backup_is_left_alone() {
    let store = Arc::new(InMemoryStore::new());
    let reconciler = reconciler(&store, config());
    store.seed_typed(&source()).unwrap();
    store.seed_typed(&backup("nightly")).unwrap();
    drive(&store, &reconciler, "nightly").await;

    store.take_writes();
    let signal = reconcile_backup_pass(&reconciler, NAMESPACE, "nightly")
        .await
        .unwrap();
    assert!(!signal.requeue);
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn test_backup_without_source_fails() {
    let store = Arc::new(InMemoryStore::new());
    let reconciler = reconciler(&store, config());
    store.seed_typed(&backup("nightly")).unwrap();

    let err = reconcile_backup_pass(&reconciler, NAMESPACE, "nightly")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exactly one APIManager"), "{err}");
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn test_main_steps_complete_after_four_cycles() {
    let store = Arc::new(InMemoryStore::new());
    let reconciler = reconciler(&store, config());
    store.seed_typed(&source()).unwrap();
    let mut nightly = backup("nightly");
    nightly.metadata.uid = Some("backup-uid".to_string());
    store.seed_typed(&nightly).unwrap();

    // Jobs left behind by an earlier attempt, already finished
    for prefix in [
        "backup-secrets-and-configmaps",
        "backup-apimanager",
        "backup-system-storage",
    ] {
        let job: Job = serde_json::from_value(serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": job_name(prefix, "backup-uid"), "namespace": NAMESPACE},
            "spec": {"template": {"spec": {"containers": []}}},
            "status": {"succeeded": 1},
        }))
        .unwrap();
        store.seed_typed(&job).unwrap();
    }

    let main_steps_completed = |store: &InMemoryStore| {
        store
            .typed::<APIManagerBackup>(NAMESPACE, "nightly")
            .and_then(|b| b.status)
            .and_then(|s| s.main_steps_completed)
            == Some(true)
    };

    for cycle in 1..=4 {
        assert!(!main_steps_completed(&store), "cycle {cycle}");
        let signal = reconcile_backup_pass(&reconciler, NAMESPACE, "nightly")
            .await
            .unwrap();
        assert!(signal.requeue, "cycle {cycle}");
    }
    assert!(main_steps_completed(&store));

    store.take_writes();
    reconcile_backup_pass(&reconciler, NAMESPACE, "nightly")
        .await
        .unwrap();
    let deletes = store
        .writes()
        .iter()
        .filter(|op| matches!(op, WriteOp::Delete(target) if target.starts_with("Job ")))
        .count();
    assert_eq!(deletes, 3);
    let status = store
        .typed::<APIManagerBackup>(NAMESPACE, "nightly")
        .unwrap()
        .status
        .unwrap();
    assert_ne!(status.completed, Some(true));
}

#[tokio::test]
async fn test_replayed_passes_create_each_object_once() {
    let store = Arc::new(InMemoryStore::new());
    let reconciler = reconciler(&store, config());
    store.seed_typed(&source()).unwrap();
    store.seed_typed(&backup("nightly")).unwrap();
    let key = ObjectKey::of::<APIManagerBackup>(NAMESPACE, "nightly");

    let mut writes = Vec::new();
    for _ in 0..30 {
        // Each pass runs twice: the replay sees the side effects but not the markers
        let before = store.snapshot(&key).unwrap();
        reconcile_backup_pass(&reconciler, NAMESPACE, "nightly")
            .await
            .unwrap();
        store.seed(before).unwrap();
        let signal = reconcile_backup_pass(&reconciler, NAMESPACE, "nightly")
            .await
            .unwrap();
        writes.extend(store.take_writes());
        succeed_jobs(&store).await;
        if !signal.requeue {
            break;
        }
    }

    let finished = store.typed::<APIManagerBackup>(NAMESPACE, "nightly").unwrap();
    assert_eq!(finished.status.unwrap().completed, Some(true));

    let mut created: Vec<&str> = writes
        .iter()
        .filter_map(|op| match op {
            WriteOp::Create(target) => Some(target.as_str()),
            _ => None,
        })
        .collect();
    let total = created.len();
    created.sort_unstable();
    created.dedup();
    assert_eq!(created.len(), total, "{writes:?}");
    assert!(created.contains(&"PersistentVolumeClaim api/nightly"));
    assert_eq!(
        created.iter().filter(|target| target.starts_with("Job ")).count(),
        3
    );
}
