//! # Watch Loop
//!
//! Runs the four controllers of the operator concurrently until a shutdown signal arrives.
//!
//! - **APIManager**: owns its Deployments, Services, ConfigMaps and Secrets. Ingresses are
//!   created by the integration worker, so their events are traced back to the APIManager
//!   through a Deployment cache.
//! - **APIManagerBackup** and **APIManagerRestore**: own their jobs.
//! - **Subscription**: publishes requirements and runs the upgrade gate.

use crate::constants::WATCH_TIMEOUT_SECS;
use crate::controller::jobs::backup::reconcile_backup;
use crate::controller::jobs::restore::reconcile_restore;
use crate::controller::ownership::OwnershipTracker;
use crate::controller::reconciler::{reconcile, Reconciler};
use crate::controller::server::ServerState;
use crate::controller::subscription::reconcile_subscription;
use crate::crd::olm::Subscription;
use crate::crd::{APIManager, APIManagerBackup, APIManagerRestore};
use crate::runtime::error_policy::error_policy_for;
use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Client, Resource};
use kube_runtime::reflector::{self, reflector, Store};
use kube_runtime::watcher::{self, Config as WatcherConfig};
use kube_runtime::{Controller, WatchStreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Namespaced API when a watch namespace is configured, cluster-wide otherwise
fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(object) => tracing::debug!(?object, "{} reconciliation completed", controller_name),
            Err(e) => tracing::warn!(error = ?e, "{} controller error", controller_name),
        }
        std::future::ready(())
    }
}

/// Deployment cache the ownership tracker looks pass-through owners up in
fn deployment_cache(
    client: &Client,
    namespace: Option<&str>,
) -> (Store<Deployment>, ControllerFuture) {
    let (deployments, writer) = reflector::store::<Deployment>();
    let cache = reflector(
        writer,
        watcher::watcher(scoped_api::<Deployment>(client, namespace), watcher_config()),
    )
    .default_backoff()
    .touched_objects()
    .for_each(|_| std::future::ready(()));
    (deployments, Box::pin(cache))
}

fn apimanager_controller(
    client: &Client,
    ctx: Arc<Reconciler>,
    deployments: Store<Deployment>,
) -> ControllerFuture {
    let namespace = ctx.config.watch_namespace.clone();
    let namespace = namespace.as_deref();

    let tracker = OwnershipTracker::for_apimanager();
    info!("- APIManager controller");
    let controller = Controller::new(
        scoped_api::<APIManager>(client, namespace),
        watcher_config(),
    )
    .owns(scoped_api::<Deployment>(client, namespace), watcher_config())
    .owns(scoped_api::<Service>(client, namespace), watcher_config())
    .owns(scoped_api::<ConfigMap>(client, namespace), watcher_config())
    .owns(scoped_api::<Secret>(client, namespace), watcher_config())
    .watches(
        scoped_api::<Ingress>(client, namespace),
        watcher_config(),
        move |ingress| tracker.requests_for(&ingress.metadata, &deployments),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy_for::<APIManager>("apimanager"), ctx)
    .for_each(log_reconcile_result("APIManager"));

    Box::pin(controller)
}

fn operation_controllers(client: &Client, ctx: Arc<Reconciler>) -> Vec<ControllerFuture> {
    let namespace = ctx.config.watch_namespace.clone();
    let namespace = namespace.as_deref();

    info!("- APIManagerBackup controller");
    let backups = Controller::new(
        scoped_api::<APIManagerBackup>(client, namespace),
        watcher_config(),
    )
    .owns(scoped_api::<Job>(client, namespace), watcher_config())
    .owns(scoped_api::<PersistentVolumeClaim>(client, namespace), watcher_config())
    .shutdown_on_signal()
    .run(
        reconcile_backup,
        error_policy_for::<APIManagerBackup>("backup"),
        ctx.clone(),
    )
    .for_each(log_reconcile_result("APIManagerBackup"));

    info!("- APIManagerRestore controller");
    let restores = Controller::new(
        scoped_api::<APIManagerRestore>(client, namespace),
        watcher_config(),
    )
    .owns(scoped_api::<Job>(client, namespace), watcher_config())
    .shutdown_on_signal()
    .run(
        reconcile_restore,
        error_policy_for::<APIManagerRestore>("restore"),
        ctx,
    )
    .for_each(log_reconcile_result("APIManagerRestore"));

    vec![Box::pin(backups), Box::pin(restores)]
}

fn subscription_controller(client: &Client, ctx: Arc<Reconciler>) -> Vec<ControllerFuture> {
    let subscriptions: Api<Subscription> =
        Api::namespaced(client.clone(), &ctx.config.operator_namespace);

    info!("- Subscription controller");
    vec![Box::pin(
        Controller::new(subscriptions, watcher_config())
            .shutdown_on_signal()
            .run(
                reconcile_subscription,
                error_policy_for::<Subscription>("subscription"),
                ctx,
            )
            .for_each(log_reconcile_result("Subscription")),
    )]
}

/// Run every controller until shutdown
pub async fn run_watch_loop(
    client: Client,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
) -> Result<()> {
    info!("Starting controllers:");
    let (deployments, cache) =
        deployment_cache(&client, reconciler.config.watch_namespace.as_deref());
    let cache_task = tokio::spawn(cache);

    let mut controllers = vec![apimanager_controller(&client, reconciler.clone(), deployments)];
    controllers.extend(operation_controllers(&client, reconciler.clone()));
    controllers.extend(subscription_controller(&client, reconciler));

    futures::future::join_all(controllers).await;
    cache_task.abort();

    server_state.is_ready.store(false, Ordering::Relaxed);
    info!("Controllers stopped, shutting down");
    Ok(())
}
