//! # Error Policy
//!
//! Requeue decisions for failed reconciliations.
//!
//! Conflicts are stale reads and requeue almost immediately without touching the backoff.
//! Every other error grows a per-resource Fibonacci backoff (1 to 10 minutes) that is reset
//! by the next successful pass.

use crate::constants;
use crate::controller::backoff::BackoffState;
use crate::controller::error::ReconcilerError;
use crate::controller::reconciler::{backoff_key, Reconciler};
use crate::observability;
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Error policy for the controller of `K`, counting errors under `controller`
pub fn error_policy_for<K>(
    controller: &'static str,
) -> impl Fn(Arc<K>, &ReconcilerError, Arc<Reconciler>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    move |obj: Arc<K>, error: &ReconcilerError, ctx: Arc<Reconciler>| {
        handle_reconciliation_error(controller, obj.as_ref(), error, &ctx)
    }
}

/// Handle a reconciliation error with per-resource Fibonacci backoff
pub fn handle_reconciliation_error<K>(
    controller: &'static str,
    obj: &K,
    error: &ReconcilerError,
    ctx: &Reconciler,
) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let kind = K::kind(&());
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        resource.name = %name,
        resource.namespace = %namespace,
        resource.kind = %kind,
        error = %error
    );
    let _error_guard = error_span.enter();

    observability::metrics::increment_reconciliation_errors_total(controller, error.metric_label());

    if error.is_conflict() {
        debug!("Conflict on {kind} {namespace}/{name}, re-reading");
        observability::metrics::increment_requeues_total("conflict");
        return Action::requeue(Duration::from_secs(constants::DEFAULT_CONFLICT_REQUEUE_SECS));
    }

    error!("Reconciliation error for {kind} {namespace}/{name}: {error:?}");

    let resource_key = backoff_key(&kind, &namespace, &name);
    let (backoff_seconds, error_count) = match ctx.backoff_states.lock() {
        Ok(mut states) => {
            let state = states
                .entry(resource_key)
                .or_insert_with(|| BackoffState::new(1, 10));
            state.increment_error();
            (state.backoff.next_backoff_seconds(), state.error_count)
        }
        Err(e) => {
            warn!("Failed to lock backoff_states: {e}, using default backoff");
            (constants::DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS, 0)
        }
    };

    let next_trigger_time = chrono::Utc::now()
        + chrono::Duration::seconds(i64::try_from(backoff_seconds).unwrap_or(i64::MAX));
    info!(
        "🔄 Retrying with Fibonacci backoff: {}s (error count: {}, trigger source: error-backoff)",
        backoff_seconds, error_count
    );
    info!(
        "📅 Next retry scheduled: {} (in {}s, trigger source: error-backoff)",
        next_trigger_time.to_rfc3339(),
        backoff_seconds
    );

    observability::metrics::increment_requeues_total("error-backoff");
    Action::requeue(Duration::from_secs(backoff_seconds))
}
