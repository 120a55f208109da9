//! # Defaults
//!
//! Pure diff from a persisted APIManager to its defaulted form.
//!
//! `compute` never talks to the store. It returns the object to persist when anything was
//! filled in, and `None` when the persisted object is already complete.

use crate::constants::OPERATOR_VERSION_ANNOTATION;
use crate::controller::reconciler::validation::validate_apimanager;
use crate::crd::{
    APIManager, ApicastEnvironmentSpec, ApicastSpec, BackendSpec, ScalableComponentSpec,
    SystemFileStorageSpec, SystemPvcSpec, SystemSpec, ZyncSpec,
};

const DEFAULT_APP_LABEL: &str = "apimanager";
const DEFAULT_TENANT_NAME: &str = "3scale";
const DEFAULT_MANAGEMENT_API: &str = "status";
const DEFAULT_REPLICAS: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum DefaultsError {
    #[error("{0}")]
    Invalid(String),
}

/// Defaulted copy of `apimanager`, or `None` when nothing changes
pub fn compute(
    apimanager: &APIManager,
    operator_version: &str,
) -> Result<Option<APIManager>, DefaultsError> {
    validate_apimanager(apimanager).map_err(DefaultsError::Invalid)?;

    let mut defaulted = apimanager.clone();
    let spec = &mut defaulted.spec;

    spec.app_label
        .get_or_insert_with(|| DEFAULT_APP_LABEL.to_string());
    spec.tenant_name
        .get_or_insert_with(|| DEFAULT_TENANT_NAME.to_string());
    spec.resource_requirements_enabled.get_or_insert(true);

    let apicast = spec.apicast.get_or_insert_with(ApicastSpec::default);
    apicast
        .management_api
        .get_or_insert_with(|| DEFAULT_MANAGEMENT_API.to_string());
    apicast.open_ssl_verify.get_or_insert(false);
    apicast.include_response_codes.get_or_insert(false);
    default_environment(apicast.staging_spec.get_or_insert_with(ApicastEnvironmentSpec::default));
    default_environment(
        apicast
            .production_spec
            .get_or_insert_with(ApicastEnvironmentSpec::default),
    );

    let backend = spec.backend.get_or_insert_with(BackendSpec::default);
    for component in [
        &mut backend.listener_spec,
        &mut backend.worker_spec,
        &mut backend.cron_spec,
    ] {
        default_scalable(component.get_or_insert_with(ScalableComponentSpec::default));
    }

    let system = spec.system.get_or_insert_with(SystemSpec::default);
    system.app_replicas.get_or_insert(DEFAULT_REPLICAS);
    system.sidekiq_replicas.get_or_insert(DEFAULT_REPLICAS);
    let storage = system
        .file_storage
        .get_or_insert_with(SystemFileStorageSpec::default);
    if storage.persistent_volume_claim.is_none() && storage.simple_storage_service.is_none() {
        storage.persistent_volume_claim = Some(SystemPvcSpec::default());
    }

    let zync = spec.zync.get_or_insert_with(ZyncSpec::default);
    zync.app_replicas.get_or_insert(DEFAULT_REPLICAS);
    zync.que_replicas.get_or_insert(DEFAULT_REPLICAS);

    // Only a fresh object is stamped; a differing value is the upgrade phase's business
    defaulted
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .entry(OPERATOR_VERSION_ANNOTATION.to_string())
        .or_insert_with(|| operator_version.to_string());

    let changed = defaulted.spec != apimanager.spec
        || defaulted.metadata.annotations != apimanager.metadata.annotations;
    Ok(changed.then_some(defaulted))
}

fn default_environment(spec: &mut ApicastEnvironmentSpec) {
    if !spec.hpa {
        spec.replicas.get_or_insert(DEFAULT_REPLICAS);
    }
}

fn default_scalable(spec: &mut ScalableComponentSpec) {
    if !spec.hpa {
        spec.replicas.get_or_insert(DEFAULT_REPLICAS);
    }
}
