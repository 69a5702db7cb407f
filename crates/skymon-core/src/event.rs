//! Monitor events published to the presentation layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ControllerStatus, SystemStatus};

/// Metadata attached to every published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Component that produced the event.
    pub source: String,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Events emitted by the controller layer, each tagged with the controller
/// name it concerns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MonitorEvent {
    /// A controller's connection status changed.
    ControllerStatusChanged {
        controller: String,
        status: ControllerStatus,
    },

    /// A controller was enabled or disabled.
    ControllerEnabledChanged { controller: String, enabled: bool },

    /// The derived system-wide status changed.
    SystemStatusChanged { status: SystemStatus },

    /// A polled or pushed value was refreshed.
    DataUpdated {
        controller: String,
        command: String,
        value: String,
    },

    /// A cached value exceeded its staleness threshold.
    DataStale { controller: String, command: String },

    /// A poll attempt failed for one command.
    PollError {
        controller: String,
        command: String,
        error: String,
    },

    /// A transport or device error scoped to one controller.
    ControllerError { controller: String, message: String },
}

impl MonitorEvent {
    /// Name of the controller the event concerns, if any.
    pub fn controller(&self) -> Option<&str> {
        match self {
            Self::ControllerStatusChanged { controller, .. }
            | Self::ControllerEnabledChanged { controller, .. }
            | Self::DataUpdated { controller, .. }
            | Self::DataStale { controller, .. }
            | Self::PollError { controller, .. }
            | Self::ControllerError { controller, .. } => Some(controller),
            Self::SystemStatusChanged { .. } => None,
        }
    }

    /// True for events a status display cares about.
    pub fn is_status_event(&self) -> bool {
        matches!(
            self,
            Self::ControllerStatusChanged { .. } | Self::SystemStatusChanged { .. }
        )
    }

    /// True for per-command data events.
    pub fn is_data_event(&self) -> bool {
        matches!(
            self,
            Self::DataUpdated { .. } | Self::DataStale { .. } | Self::PollError { .. }
        )
    }
}
