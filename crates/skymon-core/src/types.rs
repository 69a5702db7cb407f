//! Shared status and cache types.

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

/// Connection state of a single controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Aggregate connectivity over all enabled controllers.
///
/// Derived from the controller set, never stored authoritatively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemStatus {
    /// Every enabled controller is connected.
    AllConnected,
    /// Some but not all enabled controllers are connected.
    PartiallyConnected,
    /// No enabled controller is connected (or none is enabled).
    Disconnected,
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllConnected => write!(f, "all connected"),
            Self::PartiallyConnected => write!(f, "partially connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Last value received for one device command.
///
/// Entries are invalidated on failure or disconnect but never removed, so the
/// last known reading stays available for display.
#[derive(Debug, Clone)]
pub struct CachedValue {
    /// Raw value string as received from the device.
    pub value: String,
    /// When the value was last refreshed.
    pub timestamp: Instant,
    /// False once a poll failure or disconnect has outdated the entry.
    pub valid: bool,
}

impl CachedValue {
    /// Create a fresh, valid entry stamped with the current time.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            timestamp: Instant::now(),
            valid: true,
        }
    }

    /// Age of the entry relative to the current time.
    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(ControllerStatus::Connecting.to_string(), "connecting");
        assert_eq!(SystemStatus::PartiallyConnected.to_string(), "partially connected");
    }

    #[tokio::test]
    async fn test_cached_value_fresh() {
        let v = CachedValue::new("306.640");
        assert!(v.valid);
        assert_eq!(v.value, "306.640");
        assert!(v.age() < Duration::from_secs(1));
    }
}
