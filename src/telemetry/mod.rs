//! Telemetry module for logging and metrics.
//!
//! Provides:
//! - Logging configuration and initialization
//! - Packet, NAT and resolution counters

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use metrics::{Counter, InterfaceStats, MetricsRegistry};
