//! # Controller
//!
//! Reconcilers for the APIManager, its backups and restores, and the operator's own
//! subscription, plus the machinery they share.

pub mod backoff;
pub mod conditions;
pub mod error;
pub mod jobs;
pub mod ownership;
pub mod reconciler;
pub mod requirements;
pub mod server;
pub mod steps;
pub mod subscription;
pub mod upgrade_gate;
