//! Simulator configuration: which prefixes to serve and how to answer each
//! command.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Broker connection for the simulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimBrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for SimBrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: None,
            password: None,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    1883
}

/// One command/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command: String,
    /// Value published in the echo, without the trailing `#`.
    pub response: String,
    /// Milliseconds to wait before answering.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_delay_ms() -> u64 {
    50
}

/// One simulated controller behind a topic prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedController {
    pub prefix: String,
    pub commands: Vec<CommandResponse>,
}

/// Top-level simulator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default)]
    pub mqtt: SimBrokerConfig,

    #[serde(default)]
    pub controllers: Vec<SimulatedController>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            mqtt: SimBrokerConfig::default(),
            controllers: vec![
                SimulatedController {
                    prefix: "OCS".to_string(),
                    commands: vec![
                        CommandResponse {
                            command: ":DZ#".to_string(),
                            response: "306.640".to_string(),
                            delay_ms: default_delay_ms(),
                        },
                        CommandResponse {
                            command: ":RS#".to_string(),
                            response: "OPEN".to_string(),
                            delay_ms: default_delay_ms(),
                        },
                    ],
                },
                SimulatedController {
                    prefix: "OnStepX".to_string(),
                    commands: vec![
                        CommandResponse {
                            command: ":GZ#".to_string(),
                            response: "306.640".to_string(),
                            delay_ms: default_delay_ms(),
                        },
                        CommandResponse {
                            command: ":GA#".to_string(),
                            response: "+45*00'00".to_string(),
                            delay_ms: default_delay_ms(),
                        },
                        CommandResponse {
                            command: ":GR#".to_string(),
                            response: "06:30:00".to_string(),
                            delay_ms: default_delay_ms(),
                        },
                        CommandResponse {
                            command: ":GD#".to_string(),
                            response: "+12*34'56".to_string(),
                            delay_ms: default_delay_ms(),
                        },
                        CommandResponse {
                            command: ":GS#".to_string(),
                            response: "E".to_string(),
                            delay_ms: default_delay_ms(),
                        },
                    ],
                },
            ],
        }
    }
}

impl SimulatorConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&text)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controllers.is_empty() {
            return Err(ConfigError::Invalid("no controllers configured".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for ctrl in &self.controllers {
            if ctrl.prefix.is_empty() {
                return Err(ConfigError::Invalid("controller prefix must not be empty".into()));
            }
            if !seen.insert(ctrl.prefix.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate controller prefix '{}'",
                    ctrl.prefix
                )));
            }
            for cmd in &ctrl.commands {
                if cmd.command.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "empty command under prefix '{}'",
                        ctrl.prefix
                    )));
                }
            }
        }
        Ok(())
    }

    /// Find the configured answer for a prefix/command pair.
    pub fn find_response(&self, prefix: &str, command: &str) -> Option<&CommandResponse> {
        self.controllers
            .iter()
            .find(|ctrl| ctrl.prefix == prefix)?
            .commands
            .iter()
            .find(|cmd| cmd.command == command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = SimulatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.controllers.len(), 2);
    }

    #[test]
    fn test_find_response() {
        let config = SimulatorConfig::default();
        let resp = config.find_response("OCS", ":DZ#").unwrap();
        assert_eq!(resp.response, "306.640");
        assert!(config.find_response("OCS", ":GZ#").is_none());
        assert!(config.find_response("NOPE", ":DZ#").is_none());
    }

    #[test]
    fn test_load_yaml() {
        let yaml = r#"
mqtt:
  host: broker.example.org
controllers:
  - prefix: OCS
    commands:
      - command: ":DZ#"
        response: "123.456"
        delay_ms: 10
      - command: ":RS#"
        response: "CLOSED"
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simulator.yaml");
        std::fs::write(&path, yaml).unwrap();

        let config = SimulatorConfig::load_from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mqtt.host, "broker.example.org");
        let dz = config.find_response("OCS", ":DZ#").unwrap();
        assert_eq!(dz.delay_ms, 10);
        let rs = config.find_response("OCS", ":RS#").unwrap();
        assert_eq!(rs.delay_ms, 50, "delay defaults when omitted");
    }

    #[test]
    fn test_validate_rejects_duplicate_prefix() {
        let mut config = SimulatorConfig::default();
        let dup = config.controllers[0].clone();
        config.controllers.push(dup);
        assert!(config.validate().is_err());
    }
}
