//! # Reconciler Context
//!
//! Shared context handed to every controller by the runtime.

use crate::config::SharedOperatorConfig;
use crate::controller::backoff::BackoffState;
use crate::controller::conditions::{Clock, SystemClock};
use crate::controller::reconciler::builder::{DefaultObjectBuilder, ObjectBuilder};
use crate::controller::reconciler::preflights::{DeclaredVersionProbe, VersionProbe};
use crate::controller::reconciler::upgrade::{DefaultUpgradeProcedure, UpgradeProcedure};
use crate::store::SharedClient;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Context shared by the APIManager, backup, restore and subscription controllers
///
/// Every collaborator with side effects or non-determinism sits behind a trait object so the
/// reconcilers can run against an in-memory store with a frozen clock.
pub struct Reconciler {
    pub client: SharedClient,
    pub config: SharedOperatorConfig,
    pub clock: Arc<dyn Clock>,
    pub builder: Arc<dyn ObjectBuilder>,
    pub probe: Arc<dyn VersionProbe>,
    pub upgrade: Arc<dyn UpgradeProcedure>,
    /// Per-resource error backoff, keyed by `kind/namespace/name`
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(client: SharedClient, config: SharedOperatorConfig) -> Self {
        let builder = DefaultObjectBuilder::new(&config.release_version);
        Self {
            client,
            config,
            clock: Arc::new(SystemClock),
            builder: Arc::new(builder),
            probe: Arc::new(DeclaredVersionProbe),
            upgrade: Arc::new(DefaultUpgradeProcedure::default()),
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_builder(mut self, builder: Arc<dyn ObjectBuilder>) -> Self {
        self.builder = builder;
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn VersionProbe>) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub fn with_upgrade(mut self, upgrade: Arc<dyn UpgradeProcedure>) -> Self {
        self.upgrade = upgrade;
        self
    }

    pub fn now_rfc3339(&self) -> String {
        self.clock.now_rfc3339()
    }

    /// Forget the error history of a resource after a successful pass
    pub fn reset_backoff(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(resource_key);
        }
    }
}
