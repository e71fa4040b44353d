//! # hci-dataplane
//!
//! Runs an [`hci_flow::Scheduler`] on its own worker thread and loads its
//! configuration from TOML.
//!
//! - [`config`]: `DataPlaneConfig` and its TOML input form
//! - [`runtime`]: `DataPlaneRuntime`, the worker thread and its handle

pub mod config;
pub mod runtime;

pub use config::{DataPlaneConfig, DataPlaneConfigInput, RuntimeConfig, StatisticsConfig};
pub use runtime::{DataPlaneRuntime, DataPlaneSnapshot, PacketSendError};
