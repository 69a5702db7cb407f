//! Monitor configuration.
//!
//! Loaded from a YAML file with the broker connection shared by every
//! controller, global timing parameters, and the per-controller list.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// MQTT broker connection settings shared by all controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Seconds to wait for a command echo before failing it.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: f64,

    /// Seconds between reconnect attempts after a dropped link.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: None,
            password: None,
            command_timeout_secs: default_command_timeout(),
            reconnect_interval_secs: default_reconnect_interval(),
        }
    }
}

impl BrokerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.command_timeout_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    1883
}
fn default_command_timeout() -> f64 {
    2.0
}
fn default_reconnect_interval() -> u64 {
    10
}

/// One supervised controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub name: String,

    /// Controller type, matched case-insensitively against the built-in
    /// poll command tables.
    #[serde(rename = "type")]
    pub controller_type: String,

    /// Topic namespace root for this device on the shared broker.
    pub prefix: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Polling cadence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_fast_poll")]
    pub fast_poll_ms: u64,

    #[serde(default = "default_slow_poll")]
    pub slow_poll_ms: u64,

    /// A cached value is stale once older than its cadence times this factor.
    #[serde(default = "default_stale_multiplier")]
    pub stale_multiplier: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            fast_poll_ms: default_fast_poll(),
            slow_poll_ms: default_slow_poll(),
            stale_multiplier: default_stale_multiplier(),
        }
    }
}

impl PollingConfig {
    pub fn fast_interval(&self) -> Duration {
        Duration::from_millis(self.fast_poll_ms)
    }

    pub fn slow_interval(&self) -> Duration {
        Duration::from_millis(self.slow_poll_ms)
    }
}

fn default_fast_poll() -> u64 {
    1000
}
fn default_slow_poll() -> u64 {
    10000
}
fn default_stale_multiplier() -> u32 {
    3
}

/// Command queue settings for each controller's channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Milliseconds between queue drain ticks; one command is dispatched per tick.
    #[serde(default = "default_process_interval")]
    pub process_interval_ms: u64,

    /// Commands queued beyond this bound are rejected with an overflow signal.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            process_interval_ms: default_process_interval(),
            max_size: default_max_size(),
        }
    }
}

impl QueueConfig {
    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }
}

fn default_process_interval() -> u64 {
    100
}
fn default_max_size() -> usize {
    32
}

/// Logging settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Enable debug-level output.
    #[serde(default)]
    pub debug: bool,
}

/// Top-level monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub mqtt: BrokerConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            mqtt: BrokerConfig::default(),
            polling: PollingConfig::default(),
            queue: QueueConfig::default(),
            controllers: vec![
                ControllerConfig {
                    name: "Observatory".to_string(),
                    controller_type: "Observatory".to_string(),
                    prefix: "OCS".to_string(),
                    enabled: true,
                },
                ControllerConfig {
                    name: "Telescope".to_string(),
                    controller_type: "Telescope".to_string(),
                    prefix: "OnStepX".to_string(),
                    enabled: true,
                },
            ],
            logging: LoggingConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Load and parse a YAML configuration file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&text)?;
        Ok(config)
    }

    /// Serialize the configuration back to a YAML file.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = serde_yaml::to_string(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.is_empty() {
            return Err(ConfigError::Invalid("mqtt.host must not be empty".into()));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::Invalid("mqtt.port must not be 0".into()));
        }
        if self.mqtt.command_timeout_secs <= 0.0 {
            return Err(ConfigError::Invalid(
                "mqtt.command_timeout_secs must be positive".into(),
            ));
        }
        if self.polling.fast_poll_ms == 0 || self.polling.slow_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "polling intervals must be positive".into(),
            ));
        }
        if self.polling.stale_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "polling.stale_multiplier must be positive".into(),
            ));
        }
        if self.queue.max_size == 0 {
            return Err(ConfigError::Invalid("queue.max_size must be positive".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for ctrl in &self.controllers {
            if ctrl.name.is_empty() {
                return Err(ConfigError::Invalid("controller name must not be empty".into()));
            }
            if ctrl.prefix.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "controller '{}' has an empty topic prefix",
                    ctrl.name
                )));
            }
            if !seen.insert(ctrl.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate controller name '{}'",
                    ctrl.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.controllers.len(), 2);
        assert_eq!(config.controllers[0].prefix, "OCS");
        assert_eq!(config.polling.fast_poll_ms, 1000);
        config.validate().expect("defaults must validate");
    }

    #[test]
    fn test_load_minimal_yaml() {
        let yaml = r#"
mqtt:
  host: broker.example.org
  port: 1884
controllers:
  - name: Dome
    type: Observatory
    prefix: OCS
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.yaml");
        std::fs::write(&path, yaml).unwrap();

        let config = MonitorConfig::load_from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mqtt.host, "broker.example.org");
        assert_eq!(config.mqtt.port, 1884);
        // Unspecified sections fall back to defaults.
        assert_eq!(config.mqtt.command_timeout_secs, 2.0);
        assert_eq!(config.queue.max_size, 32);
        assert_eq!(config.controllers.len(), 1);
        assert!(config.controllers[0].enabled);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.yaml");

        let config = MonitorConfig::default();
        config.save_to_file(&path).unwrap();
        let loaded = MonitorConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.controllers.len(), config.controllers.len());
        assert_eq!(loaded.mqtt.port, config.mqtt.port);
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut config = MonitorConfig::default();
        let dup = config.controllers[0].clone();
        config.controllers.push(dup);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_timing() {
        let mut config = MonitorConfig::default();
        config.mqtt.command_timeout_secs = 0.0;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.polling.fast_poll_ms = 0;
        assert!(config.validate().is_err());
    }
}
