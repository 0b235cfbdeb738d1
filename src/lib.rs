//! stackmon - Cloud control-plane metrics exporter library.
//!
//! This library provides the core functionality of `stackmond`, a Prometheus
//! exporter that periodically polls cloud backend subsystems (compute,
//! network, block-storage, load-balancer, ...) and republishes their current
//! inventory as labeled metric series, retracting series whose backing
//! entities have disappeared between polls.

pub mod collector;
pub mod config;
pub mod metrics;
pub mod scheduler;
pub mod source;
pub mod web;

/// Crate version, exposed for startup logging.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
