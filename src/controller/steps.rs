//! # Step Sequencer
//!
//! Runs an ordered list of idempotent sub-reconcilers.
//!
//! Each step inspects persisted state. If its guarded action already happened it returns
//! [`StepOutcome::Continue`]; otherwise it performs the side effect, persists whatever marker
//! later steps depend on and returns [`StepOutcome::Requeue`]. The requeue forces a fresh read
//! before the next step runs, so a crash between side effect and marker only repeats the step.

use crate::constants::DEFAULT_CONFLICT_REQUEUE_SECS;
use crate::controller::error::{ReconcilerError, StepError};
use crate::observability;
use async_trait::async_trait;
use kube_runtime::controller::Action;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

/// Result of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Guarded action already done; run the next step
    Continue,
    /// Stop this pass and reconcile again, optionally after a delay
    Requeue(Option<Duration>),
}

impl StepOutcome {
    pub fn requeue_after(after: Duration) -> Self {
        Self::Requeue(Some(after))
    }
}

/// What a reconciler asks of the work queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSignal {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl ReconcileSignal {
    /// Converged; wait for the next event
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue(after: Option<Duration>) -> Self {
        Self {
            requeue: true,
            requeue_after: after,
        }
    }

    pub fn requeue_after(after: Duration) -> Self {
        Self::requeue(Some(after))
    }

    /// Combine two signals, keeping the most urgent requeue
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        if !self.requeue {
            return other;
        }
        if !other.requeue {
            return self;
        }
        let after = match (self.requeue_after, other.requeue_after) {
            (Some(a), Some(b)) => Some(a.min(b)),
            _ => None,
        };
        Self::requeue(after)
    }

    pub fn into_action(self) -> Action {
        match (self.requeue, self.requeue_after) {
            (false, _) => Action::await_change(),
            (true, Some(after)) => Action::requeue(after),
            (true, None) => Action::requeue(Duration::from_secs(DEFAULT_CONFLICT_REQUEUE_SECS)),
        }
    }
}

/// One idempotent sub-reconciler over a context `C`
#[async_trait]
pub trait Step<C: Send>: Send + Sync {
    /// Unique name within a sequence; used in logs and metrics
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut C) -> Result<StepOutcome, ReconcilerError>;
}

/// Ordered, strictly sequential list of steps
pub struct StepSequencer<C> {
    steps: Vec<Box<dyn Step<C>>>,
}

impl<C: Send> std::fmt::Debug for StepSequencer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepSequencer")
            .field("steps", &self.names())
            .finish()
    }
}

impl<C: Send> StepSequencer<C> {
    pub fn builder() -> StepSequencerBuilder<C> {
        StepSequencerBuilder { steps: Vec::new() }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run steps in order until one requeues or errors
    pub async fn run(&self, ctx: &mut C) -> Result<ReconcileSignal, ReconcilerError> {
        for step in &self.steps {
            match step.run(ctx).await? {
                StepOutcome::Continue => debug!(step = step.name(), "step.continue"),
                StepOutcome::Requeue(after) => {
                    info!(
                        step = step.name(),
                        requeue_after_secs = after.map(|d| d.as_secs()),
                        "⏸️ Step {} requested requeue",
                        step.name()
                    );
                    observability::metrics::increment_requeues_total(step.name());
                    return Ok(ReconcileSignal::requeue(after));
                }
            }
        }
        Ok(ReconcileSignal::done())
    }
}

/// Builder rejecting duplicate step names
pub struct StepSequencerBuilder<C> {
    steps: Vec<Box<dyn Step<C>>>,
}

impl<C> std::fmt::Debug for StepSequencerBuilder<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepSequencerBuilder")
            .field("steps", &self.steps.len())
            .finish()
    }
}

impl<C: Send> StepSequencerBuilder<C> {
    #[must_use]
    pub fn step(mut self, step: impl Step<C> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn build(self) -> Result<StepSequencer<C>, StepError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name()) {
                return Err(StepError::DuplicateStep(step.name()));
            }
        }
        Ok(StepSequencer { steps: self.steps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Ledger {
        done: Vec<&'static str>,
        markers: HashSet<&'static str>,
    }

    struct MarkOnce(&'static str);

    #[async_trait]
    impl Step<Ledger> for MarkOnce {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn run(&self, ctx: &mut Ledger) -> Result<StepOutcome, ReconcilerError> {
            if ctx.markers.contains(self.0) {
                return Ok(StepOutcome::Continue);
            }
            ctx.markers.insert(self.0);
            ctx.done.push(self.0);
            Ok(StepOutcome::Requeue(None))
        }
    }

    struct Fails;

    #[async_trait]
    impl Step<Ledger> for Fails {
        fn name(&self) -> &'static str {
            "fails"
        }

        async fn run(&self, _ctx: &mut Ledger) -> Result<StepOutcome, ReconcilerError> {
            Err(ReconcilerError::Validation("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn test_steps_run_one_per_pass_in_order() {
        let sequencer = StepSequencer::builder()
            .step(MarkOnce("first"))
            .step(MarkOnce("second"))
            .build()
            .unwrap();
        let mut ctx = Ledger::default();

        assert!(sequencer.run(&mut ctx).await.unwrap().requeue);
        assert_eq!(ctx.done, vec!["first"]);
        assert!(sequencer.run(&mut ctx).await.unwrap().requeue);
        assert_eq!(ctx.done, vec!["first", "second"]);
        assert_eq!(sequencer.run(&mut ctx).await.unwrap(), ReconcileSignal::done());
        assert_eq!(ctx.done, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_error_stops_sequence() {
        let sequencer = StepSequencer::builder()
            .step(Fails)
            .step(MarkOnce("never"))
            .build()
            .unwrap();
        let mut ctx = Ledger::default();
        assert!(sequencer.run(&mut ctx).await.is_err());
        assert!(ctx.done.is_empty());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = StepSequencer::<Ledger>::builder()
            .step(MarkOnce("same"))
            .step(MarkOnce("same"))
            .build();
        assert!(matches!(result, Err(StepError::DuplicateStep("same"))));
    }

    #[test]
    fn test_debug_lists_step_names() {
        let sequencer = StepSequencer::builder()
            .step(MarkOnce("first"))
            .step(Fails)
            .build()
            .unwrap();
        assert_eq!(
            format!("{sequencer:?}"),
            r#"StepSequencer { steps: ["first", "fails"] }"#
        );
    }

    #[test]
    fn test_merge_keeps_most_urgent() {
        let a = ReconcileSignal::requeue_after(Duration::from_secs(600));
        let b = ReconcileSignal::requeue_after(Duration::from_secs(5));
        assert_eq!(a.merge(b).requeue_after, Some(Duration::from_secs(5)));
        assert_eq!(ReconcileSignal::done().merge(a), a);
        assert_eq!(a.merge(ReconcileSignal::done()), a);
    }
}
