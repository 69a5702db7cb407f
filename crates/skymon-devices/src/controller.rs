//! Controller adapter.
//!
//! Binds one logical device identity to a command channel and poller, folds
//! the channel's link state into the four-state controller status model, and
//! re-emits channel and poll notifications tagged with the controller name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Duration;

use skymon_core::{CachedValue, ControllerStatus};

use crate::channel::{ChannelConfig, ChannelEvent, CommandChannel, ResponseCallback};
use crate::poller::{PollEvent, Poller};
use crate::transport::Transport;

/// Notifications emitted by a controller, tagged with its name.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    StatusChanged {
        controller: String,
        status: ControllerStatus,
    },
    DataUpdated {
        controller: String,
        command: String,
        value: String,
    },
    DataStale {
        controller: String,
        command: String,
    },
    PollError {
        controller: String,
        command: String,
        error: String,
    },
    Error {
        controller: String,
        message: String,
    },
}

/// Capability set every supervised controller exposes.
#[async_trait]
pub trait Controller: Send + Sync {
    fn name(&self) -> &str;
    fn controller_type(&self) -> &str;
    fn status(&self) -> ControllerStatus;

    async fn connect(&self);
    async fn disconnect(&self);

    /// Submit a raw device command.
    async fn send_command(&self, command: &str, callback: ResponseCallback);

    async fn start_polling(&self, fast: Duration, slow: Duration);
    async fn stop_polling(&self);
    fn is_polling(&self) -> bool;

    fn cached_value(&self, command: &str) -> Option<CachedValue>;
    fn all_cached_values(&self) -> HashMap<String, CachedValue>;
    fn is_data_stale(&self, command: &str) -> bool;

    /// Subscribe to this controller's tagged notifications.
    fn subscribe(&self) -> broadcast::Receiver<ControllerEvent>;
}

/// Pub/sub-backed controller variant.
pub struct MqttController {
    name: String,
    controller_type: String,
    channel: CommandChannel,
    poller: Poller,
    status: Arc<Mutex<ControllerStatus>>,
    events: broadcast::Sender<ControllerEvent>,
}

impl MqttController {
    /// Build a controller over the given transport and start its event relay.
    pub fn new(
        name: impl Into<String>,
        controller_type: impl Into<String>,
        channel_config: ChannelConfig,
        transport: Arc<dyn Transport>,
        stale_multiplier: u32,
    ) -> Self {
        let name = name.into();
        let controller_type = controller_type.into();

        let channel = CommandChannel::new(channel_config, transport);
        let poller = Poller::new(
            name.clone(),
            &controller_type,
            channel.clone(),
            stale_multiplier,
        );

        let (events, _) = broadcast::channel(256);
        let status = Arc::new(Mutex::new(ControllerStatus::Disconnected));

        let chan_rx = channel.subscribe_events();
        let poll_rx = poller.subscribe_events();
        tokio::spawn(relay(
            name.clone(),
            status.clone(),
            events.clone(),
            chan_rx,
            poll_rx,
        ));

        Self {
            name,
            controller_type,
            channel,
            poller,
            status,
            events,
        }
    }

    fn set_status(&self, status: ControllerStatus) {
        update_status(&self.name, &self.status, &self.events, status);
    }
}

#[async_trait]
impl Controller for MqttController {
    fn name(&self) -> &str {
        &self.name
    }

    fn controller_type(&self) -> &str {
        &self.controller_type
    }

    fn status(&self) -> ControllerStatus {
        *self.status.lock()
    }

    async fn connect(&self) {
        self.set_status(ControllerStatus::Connecting);
        self.channel.connect();
    }

    async fn disconnect(&self) {
        self.channel.disconnect();
        self.set_status(ControllerStatus::Disconnected);
    }

    async fn send_command(&self, command: &str, callback: ResponseCallback) {
        self.channel.send(command, callback).await;
    }

    async fn start_polling(&self, fast: Duration, slow: Duration) {
        self.poller.start(fast, slow);
    }

    async fn stop_polling(&self) {
        self.poller.stop();
    }

    fn is_polling(&self) -> bool {
        self.poller.is_polling()
    }

    fn cached_value(&self, command: &str) -> Option<CachedValue> {
        self.poller.cached_value(command)
    }

    fn all_cached_values(&self) -> HashMap<String, CachedValue> {
        self.poller.all_cached_values()
    }

    fn is_data_stale(&self, command: &str) -> bool {
        self.poller.is_data_stale(command)
    }

    fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }
}

fn update_status(
    name: &str,
    status: &Mutex<ControllerStatus>,
    events: &broadcast::Sender<ControllerEvent>,
    new: ControllerStatus,
) {
    {
        let mut current = status.lock();
        if *current == new {
            return;
        }
        *current = new;
    }
    tracing::info!("controller[{}]: status {}", name, new);
    let _ = events.send(ControllerEvent::StatusChanged {
        controller: name.to_string(),
        status: new,
    });
}

/// Relay task: folds channel and poll notifications into tagged controller
/// events and the status model.
async fn relay(
    name: String,
    status: Arc<Mutex<ControllerStatus>>,
    events: broadcast::Sender<ControllerEvent>,
    mut chan_rx: broadcast::Receiver<ChannelEvent>,
    mut poll_rx: broadcast::Receiver<PollEvent>,
) {
    loop {
        tokio::select! {
            ev = chan_rx.recv() => match ev {
                Ok(ChannelEvent::Connected) => {
                    update_status(&name, &status, &events, ControllerStatus::Connected);
                }
                Ok(ChannelEvent::Disconnected) => {
                    update_status(&name, &status, &events, ControllerStatus::Disconnected);
                }
                Ok(ChannelEvent::LinkError(message)) => {
                    update_status(&name, &status, &events, ControllerStatus::Error);
                    let _ = events.send(ControllerEvent::Error {
                        controller: name.clone(),
                        message,
                    });
                }
                Ok(ChannelEvent::Overflow { command }) => {
                    let _ = events.send(ControllerEvent::Error {
                        controller: name.clone(),
                        message: format!("command queue overflow: {}", command),
                    });
                }
                Ok(ChannelEvent::Unsolicited { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("controller[{}]: lagged, dropped {} channel events", name, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            ev = poll_rx.recv() => match ev {
                Ok(PollEvent::DataUpdated { command, value }) => {
                    let _ = events.send(ControllerEvent::DataUpdated {
                        controller: name.clone(),
                        command,
                        value,
                    });
                }
                Ok(PollEvent::DataStale { command }) => {
                    let _ = events.send(ControllerEvent::DataStale {
                        controller: name.clone(),
                        command,
                    });
                }
                Ok(PollEvent::PollError { command, error }) => {
                    let _ = events.send(ControllerEvent::PollError {
                        controller: name.clone(),
                        command,
                        error,
                    });
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("controller[{}]: lagged, dropped {} poll events", name, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
