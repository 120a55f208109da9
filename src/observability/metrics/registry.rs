//! Process-wide Prometheus registry.

use anyhow::Result;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Register every operator metric; call once at startup
pub fn register_metrics() -> Result<()> {
    super::controller_metrics::register(&REGISTRY)
}

/// Render the registry in the Prometheus text format
pub fn gather() -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
