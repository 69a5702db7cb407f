//! Shared test helpers: an in-memory transport and a recording callback.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use skymon_devices::channel::{CommandReply, ResponseCallback};
use skymon_devices::transport::{LinkEvent, Transport, TransportError};

/// In-memory transport: records publishes, lets tests inject echoes and drop
/// the link, and can answer commands automatically.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    published: Mutex<Vec<(String, String)>>,
    subscriptions: Mutex<Vec<String>>,
    responses: Mutex<HashMap<String, String>>,
    link_tx: Mutex<Option<mpsc::Sender<LinkEvent>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All (topic, payload) pairs published so far.
    pub fn published(&self) -> Vec<(String, String)> {
        self.inner.published.lock().clone()
    }

    /// How many times a given command was published.
    pub fn publish_count(&self, command: &str) -> usize {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|(_, payload)| payload == command)
            .count()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.lock().clone()
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.inner.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Answer future publishes of `command` with an echo carrying `value`.
    pub fn set_response(&self, command: &str, value: &str) {
        self.inner
            .responses
            .lock()
            .insert(command.to_string(), value.to_string());
    }

    pub fn clear_response(&self, command: &str) {
        self.inner.responses.lock().remove(command);
    }

    /// Inject a raw message on a subscribed topic.
    pub async fn inject(&self, topic: &str, payload: &str) {
        let tx = self.inner.link_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx
                .send(LinkEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.as_bytes().to_vec(),
                })
                .await;
        }
    }

    /// Inject a well-formed echo for a command.
    pub async fn inject_echo(&self, prefix: &str, command: &str, value: &str) {
        let payload = format!("Received: {}, Response: {}#, Source: MQTT", command, value);
        self.inject(&format!("{}/echo", prefix), &payload).await;
    }

    /// Drop the link from the broker side.
    pub async fn drop_link(&self, reason: &str) {
        let tx = self.inner.link_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx
                .send(LinkEvent::Down {
                    reason: reason.to_string(),
                })
                .await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<LinkEvent>, TransportError> {
        if self.inner.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::channel(64);
        *self.inner.link_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn disconnect(&self) {
        self.inner.link_tx.lock().take();
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("publish rejected".to_string()));
        }
        let payload = String::from_utf8_lossy(&payload).to_string();
        self.inner
            .published
            .lock()
            .push((topic.to_string(), payload.clone()));

        // Auto-respond when configured, mimicking a device on the echo topic.
        let response = self.inner.responses.lock().get(&payload).cloned();
        if let (Some(value), Some(prefix)) = (response, topic.strip_suffix("/cmd")) {
            self.inject_echo(prefix, &payload, &value).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.inner.subscriptions.lock().push(topic.to_string());
        Ok(())
    }
}

/// A callback that records its reply on a std channel, so tests can assert
/// both the reply contents and whether it fired at all.
pub fn recording() -> (ResponseCallback, std_mpsc::Receiver<CommandReply>) {
    let (tx, rx) = std_mpsc::channel();
    (
        Box::new(move |reply| {
            let _ = tx.send(reply);
        }),
        rx,
    )
}
