//! # APIManager Operator
//!
//! A Kubernetes operator that installs, upgrades, backs up and restores an API management
//! platform: the gateway (staging and production), the backend, the core system app and the
//! integration service.
//!
//! ## Overview
//!
//! - **APIManager** - converges owned resources, evaluates preflights against the published
//!   requirements and keeps a condition-based status
//! - **APIManagerBackup** / **APIManagerRestore** - resumable operations driven by one-shot
//!   jobs, with progress kept in status markers
//! - **Subscription** - publishes the requirements of the incoming operator version and holds
//!   the fleet-wide upgrade gate
//!
//! Every reconciler talks to the cluster through [`store::ConvergenceClient`], so the whole
//! reconciliation core runs against [`store::InMemoryStore`] in tests.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod runtime;
pub mod store;
