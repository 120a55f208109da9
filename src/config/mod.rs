//! # Operator Configuration
//!
//! Operator-level configuration loaded from environment variables.
//!
//! All configuration has sensible defaults and can be overridden via environment variables.
//! Environment variables are populated from the operator Deployment (including the
//! downward API for the operator namespace).

mod operator;
mod server;

pub use operator::OperatorConfig;
pub use server::ServerConfig;

use std::sync::Arc;

/// Operator configuration shared by every controller
pub type SharedOperatorConfig = Arc<OperatorConfig>;

/// Load configuration from environment variables with defaults
pub fn load_config() -> (OperatorConfig, ServerConfig) {
    (OperatorConfig::from_env(), ServerConfig::from_env())
}

/// Read environment variable or return default value
pub(crate) fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read an optional string environment variable, treating empty values as unset
pub(crate) fn env_var_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
