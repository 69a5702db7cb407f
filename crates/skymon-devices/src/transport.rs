//! Publish/subscribe transport seam.
//!
//! The command channel talks to the broker through the [`Transport`] trait so
//! tests can substitute an in-memory link. The production implementation is
//! [`MqttTransport`], built on rumqttc: the client handle serves publishes
//! and subscriptions while a spawned task pumps the event loop, forwarding
//! inbound messages and link drops over an mpsc channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};

/// Errors raised by the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not connected")]
    NotConnected,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// Notifications from an open link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A message arrived on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// The link dropped; no further events follow until reconnected.
    Down { reason: String },
}

/// Minimal publish/subscribe interface the command channel runs over.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the link. Resolves once the broker has accepted the session and
    /// returns the stream of link events for this connection epoch.
    async fn connect(&self) -> Result<mpsc::Receiver<LinkEvent>, TransportError>;

    /// Close the link.
    async fn disconnect(&self);

    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Subscribe to a topic.
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
}

/// MQTT transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker address.
    pub host: String,

    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client ID; a random one is generated when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,

    /// Seconds to wait for the broker to accept the session.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

fn default_port() -> u16 {
    1883
}
fn default_keep_alive() -> u64 {
    60
}
fn default_connection_timeout() -> u64 {
    30
}

impl MqttConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            client_id: None,
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
            connection_timeout_secs: default_connection_timeout(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// MQTT-backed [`Transport`] using rumqttc.
pub struct MqttTransport {
    config: MqttConfig,
    client: Arc<Mutex<Option<AsyncClient>>>,
}

impl MqttTransport {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            client: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<LinkEvent>, TransportError> {
        let client_id = self
            .config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("skymon_{}", uuid::Uuid::new_v4()));

        let mut opts = MqttOptions::new(client_id, &self.config.host, self.config.port);
        opts.set_keep_alive(Duration::from_secs(self.config.keep_alive));
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            opts.set_credentials(username, password);
        }

        let (client, mut event_loop) = AsyncClient::new(opts, 10);

        // Wait for the broker to accept or refuse the session before handing
        // the link over.
        let deadline = Duration::from_secs(self.config.connection_timeout_secs);
        let handshake = async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return match ack.code {
                            ConnectReturnCode::Success => Ok(()),
                            ConnectReturnCode::BadUserNamePassword
                            | ConnectReturnCode::NotAuthorized => {
                                Err(TransportError::Auth(format!("{:?}", ack.code)))
                            }
                            code => Err(TransportError::Connect(format!(
                                "broker refused session: {:?}",
                                code
                            ))),
                        };
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(TransportError::Connect(e.to_string())),
                }
            }
        };
        match tokio::time::timeout(deadline, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TransportError::Connect(format!(
                    "no broker response within {}s",
                    self.config.connection_timeout_secs
                )));
            }
        }

        *self.client.lock().await = Some(client);

        let (tx, rx) = mpsc::channel(64);
        let broker = self.config.broker_addr();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let msg = LinkEvent::Message {
                            topic: p.topic,
                            payload: p.payload.to_vec(),
                        };
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("mqtt link to {} dropped: {}", broker, e);
                        let _ = tx
                            .send(LinkEvent::Down {
                                reason: e.to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn disconnect(&self) {
        if let Some(client) = self.client.lock().await.take() {
            let _ = client.disconnect().await;
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(TransportError::NotConnected)?;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(TransportError::NotConnected)?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }
}
