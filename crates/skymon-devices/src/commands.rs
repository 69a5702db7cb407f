//! Built-in poll command tables.
//!
//! Each controller type maps to a fast command set (movement parameters) and
//! a slow command set (status parameters). Types match case-insensitively;
//! unknown types fall back to a minimal dome/shutter set.

/// Fast and slow poll command lists for one controller type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSet {
    /// Commands polled at the fast cadence.
    pub fast: Vec<String>,
    /// Commands polled at the slow cadence.
    pub slow: Vec<String>,
}

impl CommandSet {
    fn new(fast: &[&str], slow: &[&str]) -> Self {
        Self {
            fast: fast.iter().map(|c| c.to_string()).collect(),
            slow: slow.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Whether the command belongs to the fast set.
    pub fn is_fast(&self, command: &str) -> bool {
        self.fast.iter().any(|c| c == command)
    }

    /// Whether the command belongs to either set.
    pub fn contains(&self, command: &str) -> bool {
        self.is_fast(command) || self.slow.iter().any(|c| c == command)
    }
}

/// Look up the command set for a controller type.
pub fn command_set_for(controller_type: &str) -> CommandSet {
    match controller_type.to_ascii_lowercase().as_str() {
        // Dome azimuth moves; roof/shutter state changes rarely.
        "observatory" => CommandSet::new(&[":DZ#"], &[":RS#"]),
        // Mount position on the fast cadence, side of pier on the slow one.
        "telescope" => CommandSet::new(&[":GZ#", ":GA#", ":GR#", ":GD#"], &[":GS#"]),
        other => {
            tracing::debug!("no command table for controller type '{}', using default", other);
            CommandSet::new(&[":DZ#"], &[":RS#"])
        }
    }
}
