//! fleetctl-daemon library
//!
//! Core functionality for the fleet-management control-plane daemon:
//! SSH-based remote execution, an encrypted key vault, a fleet registry,
//! a monitoring loop, a time-series store, a Docker container engine and
//! compose orchestrator, an alert evaluator, a notification dispatcher, and
//! the plugin host that wires them all together behind an HTTP API.

pub mod alerts;
pub mod compose;
pub mod config;
pub mod containers;
pub mod cron;
pub mod database;
pub mod error;
pub mod executor;
pub mod fleet;
pub mod monitor;
pub mod notifier;
pub mod plugin;
pub mod router;
pub mod timeseries;
pub mod types;
pub mod vault;

pub use config::Configuration;
pub use error::{DaemonError, Result};
