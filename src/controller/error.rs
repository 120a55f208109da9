//! # Reconciler Errors
//!
//! Error types surfaced by reconcilers to the controller runtime.

use crate::store::StoreError;

/// Failure while assembling desired objects for a component
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("component {component}: {message}")]
    Invalid { component: String, message: String },
    #[error("failed to encode desired object: {0}")]
    Encode(#[from] StoreError),
}

/// Failure while composing a step sequence
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("step {0} registered twice")]
    DuplicateStep(&'static str),
}

/// Errors returned from a reconcile pass
#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid spec: {0}")]
    Validation(String),
    #[error("defaults error: {0}")]
    Defaults(#[from] crate::controller::reconciler::DefaultsError),
    #[error("failed to build desired objects: {0}")]
    Build(#[from] BuildError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("step sequence error: {0}")]
    Step(#[from] StepError),
    #[error("object is missing {0}")]
    MissingObjectKey(&'static str),
    #[error("timed out waiting for the install plan of subscription {0}")]
    InstallPlanTimeout(String),
    #[error("upgrade procedure {step} failed: {message}")]
    Upgrade { step: &'static str, message: String },
}

impl ReconcilerError {
    /// Stale-write rejections; resolved by re-running the reconcile
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }

    /// Short label used for metrics
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Store(e) if e.is_conflict() => "conflict",
            Self::Store(_) => "store",
            Self::Validation(_) => "validation",
            Self::Build(_) => "build",
            Self::Serialization(_) => "serialization",
            Self::Step(_) => "step",
            Self::MissingObjectKey(_) => "missing_object_key",
            Self::Defaults(_) => "defaults",
            Self::InstallPlanTimeout(_) => "install_plan_timeout",
            Self::Upgrade { .. } => "upgrade",
        }
    }
}
