//! Core traits and types for skymon.
//!
//! This crate defines the foundational abstractions shared across the
//! workspace: configuration, status types, the monitor event bus, and
//! device value decoding.

pub mod config;
pub mod event;
pub mod eventbus;
pub mod types;
pub mod value;

pub use config::{
    BrokerConfig, ConfigError, ControllerConfig, LoggingConfig, MonitorConfig, PollingConfig,
    QueueConfig,
};
pub use event::{EventMetadata, MonitorEvent};
pub use eventbus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventBusReceiver};
pub use types::{CachedValue, ControllerStatus, SystemStatus};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
