//! Controller supervision over a shared publish/subscribe transport.
//!
//! ## Architecture
//!
//! - **Transport**: publish/subscribe seam; [`MqttTransport`] is the
//!   production implementation.
//! - **CommandChannel**: per-controller request/response layer — bounded FIFO
//!   queue, sequence numbers, echo correlation, per-command timeouts and
//!   fixed-delay reconnect.
//! - **Poller**: dual-cadence scheduler with a timestamped value cache and
//!   staleness detection.
//! - **Controller**: adapter binding a device identity to one channel/poller
//!   pair, exposed through the [`Controller`] trait.
//! - **ControllerManager**: owns the configured controller set and derives
//!   the system-wide status.

pub mod channel;
pub mod commands;
pub mod controller;
pub mod manager;
pub mod poller;
pub mod protocol;
pub mod transport;

pub use channel::{
    ChannelConfig, ChannelEvent, CommandChannel, CommandReply, ResponseCallback,
};
pub use commands::{CommandSet, command_set_for};
pub use controller::{Controller, ControllerEvent, MqttController};
pub use manager::ControllerManager;
pub use poller::{PollEvent, Poller};
pub use protocol::{EchoFrame, parse_echo};
pub use transport::{LinkEvent, MqttConfig, MqttTransport, Transport, TransportError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
