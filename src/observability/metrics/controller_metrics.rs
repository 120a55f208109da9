//! # Controller Metrics
//!
//! Reconciliation, requeue, job and upgrade gate metrics. Series are labelled by controller
//! (`apimanager`, `backup`, `restore`, `subscription`).

use anyhow::Result;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::LazyLock;

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "apimanager_operator_reconciliations_total",
            "Total number of reconciliations",
        ),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "apimanager_operator_reconciliation_errors_total",
            "Total number of failed reconciliations by error kind",
        ),
        &["controller", "error"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "apimanager_operator_reconciliation_duration_seconds",
            "Duration of reconciliations in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 300.0]),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "apimanager_operator_requeues_total",
            "Total number of requeues by reason (step name or error-backoff)",
        ),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static JOBS_LAUNCHED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "apimanager_operator_jobs_launched_total",
        "Total number of backup and restore jobs created",
    )
    .expect("Failed to create JOBS_LAUNCHED_TOTAL metric - this should never happen")
});

static GATE_DECISIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "apimanager_operator_upgrade_gate_decisions_total",
            "Total number of upgrade gate evaluations by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create GATE_DECISIONS_TOTAL metric - this should never happen")
});

static STATUS_WRITES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "apimanager_operator_status_writes_total",
            "Total number of status updates written",
        ),
        &["controller"],
    )
    .expect("Failed to create STATUS_WRITES_TOTAL metric - this should never happen")
});

pub(super) fn register(registry: &Registry) -> Result<()> {
    registry.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    registry.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    registry.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    registry.register(Box::new(REQUEUES_TOTAL.clone()))?;
    registry.register(Box::new(JOBS_LAUNCHED_TOTAL.clone()))?;
    registry.register(Box::new(GATE_DECISIONS_TOTAL.clone()))?;
    registry.register(Box::new(STATUS_WRITES_TOTAL.clone()))?;
    Ok(())
}

pub fn increment_reconciliations_total(controller: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[controller]).inc();
}

pub fn increment_reconciliation_errors_total(controller: &str, error: &str) {
    RECONCILIATION_ERRORS_TOTAL
        .with_label_values(&[controller, error])
        .inc();
}

pub fn observe_reconciliation_duration(controller: &str, seconds: f64) {
    RECONCILIATION_DURATION
        .with_label_values(&[controller])
        .observe(seconds);
}

pub fn increment_requeues_total(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn increment_jobs_launched_total() {
    JOBS_LAUNCHED_TOTAL.inc();
}

pub fn increment_gate_decisions_total(reason: &str) {
    GATE_DECISIONS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn increment_status_writes_total(controller: &str) {
    STATUS_WRITES_TOTAL.with_label_values(&[controller]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_and_count() {
        let registry = Registry::new();
        register(&registry).unwrap();
        let before = REQUEUES_TOTAL.with_label_values(&["unit-test"]).get();
        increment_requeues_total("unit-test");
        assert_eq!(REQUEUES_TOTAL.with_label_values(&["unit-test"]).get(), before + 1);
        assert!(!registry.gather().is_empty());
    }
}
