//! # APIManager Reconciler
//!
//! Entry point for every APIManager event.
//!
//! A pass always reloads the resource and then runs these phases in order:
//!
//! 1. **Defaults** - persist the defaulted spec and requeue when anything was filled in
//! 2. **Release hop check** - stop when the installed release is more than one minor behind
//! 3. **Upgrade** - run migrations when the operator version changed, stamp the operator
//!    version, requeue
//! 4. **Spec** - preflights, release stamp, then one step per component
//! 5. **Status** - always runs; a spec error is returned after status is persisted

pub mod builder;
pub mod components;
pub mod defaults;
pub mod preflights;
pub mod status;
mod types;
pub mod upgrade;
pub mod validation;

pub use defaults::DefaultsError;
pub use types::Reconciler;

use crate::config::SharedOperatorConfig;
use crate::constants::*;
use crate::controller::error::ReconcilerError;
use crate::controller::steps::{ReconcileSignal, StepSequencer};
use crate::crd::APIManager;
use crate::observability;
use crate::store::{get_as, update_as, SharedClient};
use components::ComponentStep;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use preflights::{PreflightReport, PreflightStep, ReleaseStampStep, VersionProbe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Per-pass state threaded through the spec phase steps
pub struct DriverContext {
    pub apimanager: APIManager,
    pub client: SharedClient,
    pub config: SharedOperatorConfig,
    pub probe: Arc<dyn VersionProbe>,
    /// Set by the preflight step; drives the Preflights condition
    pub preflight: Option<PreflightReport>,
}

/// Key under which error backoff is tracked for a resource
pub fn backoff_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{kind}/{namespace}/{name}")
}

/// Controller entry point
pub async fn reconcile(
    apimanager: Arc<APIManager>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let name = apimanager.name_any();
    let namespace = apimanager
        .namespace()
        .ok_or(ReconcilerError::MissingObjectKey("metadata.namespace"))?;

    let span = info_span!(
        "apimanager.reconcile",
        resource.name = %name,
        resource.namespace = %namespace,
        resource.kind = APIMANAGER_KIND
    );
    let start = Instant::now();
    observability::metrics::increment_reconciliations_total("apimanager");

    let result = reconcile_apimanager(&ctx, &namespace, &name)
        .instrument(span)
        .await;
    observability::metrics::observe_reconciliation_duration(
        "apimanager",
        start.elapsed().as_secs_f64(),
    );

    let signal = result?;
    ctx.reset_backoff(&backoff_key(APIMANAGER_KIND, &namespace, &name));
    Ok(signal.into_action())
}

/// One reconcile pass for the APIManager `namespace/name`
pub async fn reconcile_apimanager(
    reconciler: &Reconciler,
    namespace: &str,
    name: &str,
) -> Result<ReconcileSignal, ReconcilerError> {
    let client = reconciler.client.as_ref();
    let Some(apimanager) = get_as::<APIManager>(client, namespace, name).await? else {
        debug!("APIManager {namespace}/{name} is gone");
        return Ok(ReconcileSignal::done());
    };

    match defaults::compute(&apimanager, &reconciler.config.operator_version) {
        Ok(Some(defaulted)) => {
            update_as(client, &defaulted).await?;
            info!("✅ Applied defaults to APIManager {namespace}/{name}");
            return Ok(ReconcileSignal::requeue(None));
        }
        Ok(None) => {}
        Err(e) => {
            status::reconcile_status(reconciler, namespace, name, None).await?;
            return Err(e.into());
        }
    }

    if !reconciler.config.preflights_disabled {
        if let Some(report) =
            preflights::multi_minor_hop(&apimanager, &reconciler.config.release_version)
        {
            warn!("Multi minor version hop detected for APIManager {namespace}/{name}");
            status::reconcile_status(reconciler, namespace, name, Some(&report)).await?;
            return Ok(ReconcileSignal::requeue_after(
                reconciler.config.preflight_retry(),
            ));
        }
    }

    let running = reconciler.config.operator_version.as_str();
    if let Some(installed) = apimanager
        .operator_version_annotation()
        .filter(|installed| *installed != running)
    {
        reconciler
            .upgrade
            .run(client, &apimanager, installed, running)
            .await?;
        // The release annotation moves only once preflights pass
        let mut stamped = apimanager.clone();
        stamped
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(OPERATOR_VERSION_ANNOTATION.to_string(), running.to_string());
        update_as(client, &stamped).await?;
        info!("⬆️ Upgraded APIManager {namespace}/{name} to operator {running}");
        return Ok(ReconcileSignal::requeue(None));
    }

    let mut ctx = DriverContext {
        apimanager,
        client: reconciler.client.clone(),
        config: reconciler.config.clone(),
        probe: reconciler.probe.clone(),
        preflight: None,
    };
    let spec_result = run_spec_phase(reconciler, &mut ctx).await;
    let status_result =
        status::reconcile_status(reconciler, namespace, name, ctx.preflight.as_ref()).await;

    let spec_signal = spec_result?;
    let status_signal = status_result?;
    // Failed preflights own the retry interval
    if matches!(ctx.preflight, Some(PreflightReport::Failed { .. })) {
        return Ok(spec_signal);
    }
    Ok(spec_signal.merge(status_signal))
}

async fn run_spec_phase(
    reconciler: &Reconciler,
    ctx: &mut DriverContext,
) -> Result<ReconcileSignal, ReconcilerError> {
    let plans = reconciler.builder.components(&ctx.apimanager)?;
    let mut sequence = StepSequencer::builder()
        .step(PreflightStep)
        .step(ReleaseStampStep);
    for plan in plans {
        sequence = sequence.step(ComponentStep::new(plan));
    }
    sequence.build()?.run(ctx).await
}
