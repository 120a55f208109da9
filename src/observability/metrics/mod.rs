//! # Metrics
//!
//! Counters and histograms for the operator's controllers, registered in a single
//! process-wide registry.

mod controller_metrics;
pub mod registry;

pub use controller_metrics::*;
pub use registry::{gather, register_metrics};
