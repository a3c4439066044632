//! Periodic expiration scanning (§4.E).

pub mod monitor;

pub use monitor::{TtlMonitor, TtlMonitorConfig};
