//! Controller manager.
//!
//! Owns the set of controllers built from configuration, drives global
//! connect and polling operations, and folds per-controller status into one
//! system-wide status. All manager operations run to completion behind one
//! async mutex, so no operation observes another half-applied.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use skymon_core::{
    CachedValue, ControllerConfig, ControllerStatus, EventBus, MonitorConfig, MonitorEvent,
    SystemStatus,
};

use crate::channel::ChannelConfig;
use crate::controller::{Controller, ControllerEvent, MqttController};
use crate::transport::{MqttConfig, MqttTransport};

const EVENT_SOURCE: &str = "manager";

struct ControllerRecord {
    controller_type: String,
    enabled: bool,
    status: ControllerStatus,
    controller: Arc<dyn Controller>,
    watcher: JoinHandle<()>,
}

struct ManagerState {
    controllers: HashMap<String, ControllerRecord>,
    system_status: SystemStatus,
    /// Active manager-wide cadence, if polling is on.
    polling: Option<(Duration, Duration)>,
}

impl ManagerState {
    fn enabled_count(&self) -> usize {
        self.controllers.values().filter(|r| r.enabled).count()
    }

    fn connected_count(&self) -> usize {
        self.controllers
            .values()
            .filter(|r| r.enabled && r.status == ControllerStatus::Connected)
            .count()
    }
}

/// Supervisor for the configured controller set.
pub struct ControllerManager {
    state: Arc<Mutex<ManagerState>>,
    bus: EventBus,
}

impl ControllerManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManagerState {
                controllers: HashMap::new(),
                system_status: SystemStatus::Disconnected,
                polling: None,
            })),
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Tear down any existing controllers and rebuild the set from
    /// configuration.
    pub async fn load_from_config(&self, config: &MonitorConfig) {
        tracing::info!("manager: loading controllers from configuration");
        let mut st = self.state.lock().await;

        for (name, record) in st.controllers.drain() {
            tracing::debug!("manager: tearing down controller '{}'", name);
            record.controller.stop_polling().await;
            record.controller.disconnect().await;
            record.watcher.abort();
        }
        st.polling = None;

        for ctrl in &config.controllers {
            let controller = build_mqtt_controller(ctrl, config);
            self.insert_locked(&mut st, controller, ctrl.enabled);
        }

        tracing::info!(
            "manager: loaded {} controller(s), {} enabled",
            st.controllers.len(),
            st.enabled_count()
        );
        self.recompute_system_status(&mut st);
    }

    /// Add a single controller built from configuration. Skipped with a
    /// warning if the name is already present.
    pub async fn add_controller(&self, ctrl: &ControllerConfig, config: &MonitorConfig) {
        let mut st = self.state.lock().await;
        if st.controllers.contains_key(&ctrl.name) {
            tracing::warn!("manager: controller '{}' already exists, skipping", ctrl.name);
            return;
        }
        let controller = build_mqtt_controller(ctrl, config);
        self.insert_locked(&mut st, controller, ctrl.enabled);
        self.recompute_system_status(&mut st);
    }

    /// Register an externally built controller. Used for non-default
    /// transports; the record starts Disconnected.
    pub async fn insert_controller(&self, controller: Arc<dyn Controller>, enabled: bool) {
        let mut st = self.state.lock().await;
        let name = controller.name().to_string();
        if st.controllers.contains_key(&name) {
            tracing::warn!("manager: controller '{}' already exists, skipping", name);
            return;
        }
        self.insert_locked(&mut st, controller, enabled);
        self.recompute_system_status(&mut st);
    }

    /// Remove a controller, tearing down its poller and channel.
    pub async fn remove_controller(&self, name: &str) {
        let mut st = self.state.lock().await;
        match st.controllers.remove(name) {
            Some(record) => {
                tracing::info!("manager: removing controller '{}'", name);
                record.controller.stop_polling().await;
                record.controller.disconnect().await;
                record.watcher.abort();
                self.recompute_system_status(&mut st);
            }
            None => {
                tracing::warn!("manager: controller '{}' not found", name);
            }
        }
    }

    /// Enable or disable a controller. A no-op when the requested state
    /// already matches. Disabling stops its poller and disconnects its
    /// channel; enabling connects it and joins any active polling cadence.
    pub async fn enable_controller(&self, name: &str, enabled: bool) {
        let mut st = self.state.lock().await;
        let Some(record) = st.controllers.get_mut(name) else {
            tracing::warn!("manager: controller '{}' not found", name);
            return;
        };
        if record.enabled == enabled {
            return;
        }

        tracing::info!(
            "manager: {} controller '{}'",
            if enabled { "enabling" } else { "disabling" },
            name
        );
        record.enabled = enabled;
        let controller = record.controller.clone();
        let polling = st.polling;

        if enabled {
            controller.connect().await;
            if let Some((fast, slow)) = polling {
                controller.start_polling(fast, slow).await;
            }
        } else {
            controller.stop_polling().await;
            controller.disconnect().await;
        }

        self.bus.publish(
            MonitorEvent::ControllerEnabledChanged {
                controller: name.to_string(),
                enabled,
            },
            EVENT_SOURCE,
        );
        self.recompute_system_status(&mut st);
    }

    /// Connect every enabled controller.
    pub async fn connect_all(&self) {
        let st = self.state.lock().await;
        tracing::info!("manager: connecting all enabled controllers");
        for record in st.controllers.values().filter(|r| r.enabled) {
            record.controller.connect().await;
        }
    }

    /// Disconnect every enabled controller.
    pub async fn disconnect_all(&self) {
        let st = self.state.lock().await;
        tracing::info!("manager: disconnecting all enabled controllers");
        for record in st.controllers.values().filter(|r| r.enabled) {
            record.controller.disconnect().await;
        }
    }

    pub async fn connect_controller(&self, name: &str) {
        let st = self.state.lock().await;
        match st.controllers.get(name) {
            Some(record) if record.enabled => record.controller.connect().await,
            Some(_) => {
                tracing::warn!("manager: controller '{}' is disabled, cannot connect", name);
            }
            None => tracing::warn!("manager: controller '{}' not found", name),
        }
    }

    pub async fn disconnect_controller(&self, name: &str) {
        let st = self.state.lock().await;
        match st.controllers.get(name) {
            Some(record) => record.controller.disconnect().await,
            None => tracing::warn!("manager: controller '{}' not found", name),
        }
    }

    /// Broadcast a polling cadence to every enabled controller.
    pub async fn start_polling(&self, fast: Duration, slow: Duration) {
        let mut st = self.state.lock().await;
        st.polling = Some((fast, slow));
        tracing::info!("manager: starting polling (fast {:?}, slow {:?})", fast, slow);
        for record in st.controllers.values().filter(|r| r.enabled) {
            record.controller.start_polling(fast, slow).await;
        }
    }

    /// Stop polling on every controller, enabled or not.
    pub async fn stop_polling(&self) {
        let mut st = self.state.lock().await;
        if st.polling.take().is_none() {
            return;
        }
        tracing::info!("manager: stopping polling");
        for record in st.controllers.values() {
            record.controller.stop_polling().await;
        }
    }

    pub async fn system_status(&self) -> SystemStatus {
        self.state.lock().await.system_status
    }

    pub async fn controller_status(&self, name: &str) -> Option<ControllerStatus> {
        self.state.lock().await.controllers.get(name).map(|r| r.status)
    }

    pub async fn is_controller_enabled(&self, name: &str) -> bool {
        self.state
            .lock()
            .await
            .controllers
            .get(name)
            .is_some_and(|r| r.enabled)
    }

    pub async fn controller_type(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .controllers
            .get(name)
            .map(|r| r.controller_type.clone())
    }

    pub async fn controller_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.state.lock().await.controllers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Enabled controllers currently connected.
    pub async fn connected_controllers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .await
            .controllers
            .iter()
            .filter(|(_, r)| r.enabled && r.status == ControllerStatus::Connected)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Enabled controllers not currently connected.
    pub async fn disconnected_controllers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .await
            .controllers
            .iter()
            .filter(|(_, r)| r.enabled && r.status != ControllerStatus::Connected)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn enabled_count(&self) -> usize {
        self.state.lock().await.enabled_count()
    }

    pub async fn connected_count(&self) -> usize {
        self.state.lock().await.connected_count()
    }

    pub async fn cached_value(&self, name: &str, command: &str) -> Option<CachedValue> {
        self.state
            .lock()
            .await
            .controllers
            .get(name)
            .and_then(|r| r.controller.cached_value(command))
    }

    pub async fn all_cached_values(&self, name: &str) -> HashMap<String, CachedValue> {
        self.state
            .lock()
            .await
            .controllers
            .get(name)
            .map(|r| r.controller.all_cached_values())
            .unwrap_or_default()
    }

    pub async fn is_data_stale(&self, name: &str, command: &str) -> bool {
        self.state
            .lock()
            .await
            .controllers
            .get(name)
            .is_none_or(|r| r.controller.is_data_stale(command))
    }

    fn insert_locked(
        &self,
        st: &mut ManagerState,
        controller: Arc<dyn Controller>,
        enabled: bool,
    ) {
        let name = controller.name().to_string();
        tracing::info!(
            "manager: adding controller '{}' (type {}, enabled {})",
            name,
            controller.controller_type(),
            enabled
        );

        let watcher = tokio::spawn(watch_controller(
            self.state.clone(),
            self.bus.clone(),
            controller.subscribe(),
        ));

        st.controllers.insert(
            name,
            ControllerRecord {
                controller_type: controller.controller_type().to_string(),
                enabled,
                status: controller.status(),
                controller,
                watcher,
            },
        );
    }

    fn recompute_system_status(&self, st: &mut ManagerState) {
        recompute_system_status(st, &self.bus);
    }
}

/// Re-derive the system-wide status and emit it if it changed.
fn recompute_system_status(st: &mut ManagerState, bus: &EventBus) {
    let enabled = st.enabled_count();
    let connected = st.connected_count();

    let new_status = if enabled == 0 || connected == 0 {
        SystemStatus::Disconnected
    } else if connected == enabled {
        SystemStatus::AllConnected
    } else {
        SystemStatus::PartiallyConnected
    };

    if st.system_status != new_status {
        st.system_status = new_status;
        tracing::info!(
            "manager: system status changed: {} ({}/{})",
            new_status,
            connected,
            enabled
        );
        bus.publish(
            MonitorEvent::SystemStatusChanged { status: new_status },
            EVENT_SOURCE,
        );
    }
}

/// Build the production MQTT-backed controller for one configuration entry.
fn build_mqtt_controller(ctrl: &ControllerConfig, config: &MonitorConfig) -> Arc<dyn Controller> {
    let mut mqtt = MqttConfig::new(config.mqtt.host.as_str()).with_port(config.mqtt.port);
    if let (Some(username), Some(password)) = (&config.mqtt.username, &config.mqtt.password) {
        mqtt = mqtt.with_auth(username.as_str(), password.as_str());
    }

    let mut channel_config = ChannelConfig::new(ctrl.prefix.as_str());
    channel_config.command_timeout = config.mqtt.command_timeout();
    channel_config.reconnect_interval = config.mqtt.reconnect_interval();
    channel_config.queue_process_interval = config.queue.process_interval();
    channel_config.max_queue_size = config.queue.max_size;

    Arc::new(MqttController::new(
        ctrl.name.as_str(),
        ctrl.controller_type.as_str(),
        channel_config,
        Arc::new(MqttTransport::new(mqtt)),
        config.polling.stale_multiplier,
    ))
}

/// Watcher task: one per controller, folding its tagged events into the
/// record set and the public monitor event stream.
async fn watch_controller(
    state: Arc<Mutex<ManagerState>>,
    bus: EventBus,
    mut rx: tokio::sync::broadcast::Receiver<ControllerEvent>,
) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match rx.recv().await {
            Ok(ControllerEvent::StatusChanged { controller, status }) => {
                let mut st = state.lock().await;
                let Some(record) = st.controllers.get_mut(&controller) else {
                    continue;
                };
                if record.status == status {
                    continue;
                }
                record.status = status;
                bus.publish(
                    MonitorEvent::ControllerStatusChanged {
                        controller: controller.clone(),
                        status,
                    },
                    EVENT_SOURCE,
                );
                recompute_system_status(&mut st, &bus);
            }
            Ok(ControllerEvent::DataUpdated {
                controller,
                command,
                value,
            }) => {
                bus.publish(
                    MonitorEvent::DataUpdated {
                        controller,
                        command,
                        value,
                    },
                    EVENT_SOURCE,
                );
            }
            Ok(ControllerEvent::DataStale { controller, command }) => {
                bus.publish(MonitorEvent::DataStale { controller, command }, EVENT_SOURCE);
            }
            Ok(ControllerEvent::PollError {
                controller,
                command,
                error,
            }) => {
                bus.publish(
                    MonitorEvent::PollError {
                        controller,
                        command,
                        error,
                    },
                    EVENT_SOURCE,
                );
            }
            Ok(ControllerEvent::Error { controller, message }) => {
                tracing::error!("manager: controller '{}' error: {}", controller, message);
                bus.publish(
                    MonitorEvent::ControllerError {
                        controller,
                        message,
                    },
                    EVENT_SOURCE,
                );
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("manager: watcher lagged, dropped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
