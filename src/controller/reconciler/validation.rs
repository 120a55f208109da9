//! # Validation
//!
//! Rejects APIManager specs the operator cannot install.

use crate::crd::{APIManager, ApicastEnvironment};
use std::collections::HashSet;

/// Validate an APIManager spec, returning a human-readable reason on failure
pub fn validate_apimanager(apimanager: &APIManager) -> Result<(), String> {
    if let Some(storage) = apimanager.system_file_storage() {
        if storage.persistent_volume_claim.is_some() && storage.simple_storage_service.is_some() {
            return Err(
                "system file storage: only one of persistentVolumeClaim and simpleStorageService can be set"
                    .to_string(),
            );
        }
    }

    if let Some(production) = apimanager.apicast_environment(ApicastEnvironment::Production) {
        if let (Some(http), Some(https)) = (production.http_port, production.https_port) {
            if http == https {
                return Err(format!(
                    "apicast production: httpsPort and httpPort cannot both be {http}"
                ));
            }
        }
    }

    for env in ApicastEnvironment::ALL {
        let Some(spec) = apimanager.apicast_environment(env) else {
            continue;
        };
        let mut seen = HashSet::new();
        for secret in spec
            .custom_environments
            .iter()
            .filter_map(|custom| custom.secret_ref.as_ref())
        {
            if !seen.insert(secret.name.as_str()) {
                return Err(format!(
                    "{}: custom environment secret {} is referenced more than once",
                    env.display_name(),
                    secret.name
                ));
            }
        }
    }

    Ok(())
}
