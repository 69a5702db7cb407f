//! Per-controller command channel.
//!
//! Turns the raw `<prefix>/cmd` / `<prefix>/echo` topic pair into a bounded
//! request/response service: commands are queued FIFO, dispatched one per
//! drain tick, correlated against echoes by command text (oldest in flight
//! wins), and failed individually on timeout. A dropped link flushes the
//! whole queue for this controller and schedules a fixed-delay reconnect;
//! other controllers are never affected.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::{self, Duration, Instant, MissedTickBehavior, Sleep};
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;

use skymon_core::value;

use crate::protocol;
use crate::transport::{LinkEvent, Transport};

/// Reply delivered to a command callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    /// Command text as submitted.
    pub command: String,
    /// Response value; empty on failure.
    pub value: String,
    pub success: bool,
    /// Device error code, or -1 when the device reported none.
    pub error_code: i32,
}

impl CommandReply {
    fn failure(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            value: String::new(),
            success: false,
            error_code: -1,
        }
    }
}

/// Callback invoked exactly once when a command resolves.
pub type ResponseCallback = Box<dyn FnOnce(CommandReply) + Send>;

/// Channel timing and bounds.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Topic namespace root for this controller.
    pub prefix: String,
    /// How long to wait for an echo after dispatch.
    pub command_timeout: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Queue drain cadence; one command is dispatched per tick.
    pub queue_process_interval: Duration,
    /// Commands queued beyond this bound are rejected.
    pub max_queue_size: usize,
}

impl ChannelConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            command_timeout: Duration::from_secs(2),
            reconnect_interval: Duration::from_secs(10),
            queue_process_interval: Duration::from_millis(100),
            max_queue_size: 32,
        }
    }
}

/// Notifications emitted by a channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The link is up and the echo topic is subscribed.
    Connected,
    /// The link dropped; every outstanding command has been failed.
    Disconnected,
    /// The transport reported an error (connect refusal, auth failure, ...).
    LinkError(String),
    /// A command was rejected because the queue is at capacity. Distinct
    /// from a timeout so callers can apply backpressure.
    Overflow { command: String },
    /// An echo arrived that matches no in-flight command.
    Unsolicited {
        command: String,
        value: String,
        /// Set when the value is a bare device error code.
        error_code: Option<i32>,
    },
}

/// A command waiting in the FIFO queue.
struct QueuedCommand {
    command: String,
    seq: u64,
    callback: ResponseCallback,
    queued_at: Instant,
}

/// A command dispatched to the device, awaiting its echo.
struct SentCommand {
    command: String,
    seq: u64,
    callback: ResponseCallback,
    sent_at: Instant,
    timeout_key: Key,
}

struct ChannelState {
    link_up: bool,
    auto_reconnect: bool,
    /// Next sequence number; unique per connection epoch, reset on disconnect.
    next_seq: u64,
    queue: VecDeque<QueuedCommand>,
    /// Dispatched commands in ascending sequence order.
    in_flight: VecDeque<SentCommand>,
}

struct Inner {
    config: ChannelConfig,
    cmd_topic: String,
    echo_topic: String,
    transport: Arc<dyn Transport>,
    state: Mutex<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
    connected: AtomicBool,
}

enum Control {
    Connect,
    Disconnect,
}

/// Handle to one controller's command channel.
///
/// Cloning is cheap; all clones drive the same channel task.
#[derive(Clone)]
pub struct CommandChannel {
    inner: Arc<Inner>,
    ctrl: mpsc::UnboundedSender<Control>,
}

impl CommandChannel {
    /// Create a channel over the given transport and start its task.
    pub fn new(config: ChannelConfig, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(Inner {
            cmd_topic: format!("{}/cmd", config.prefix),
            echo_topic: format!("{}/echo", config.prefix),
            config,
            transport,
            state: Mutex::new(ChannelState {
                link_up: false,
                auto_reconnect: true,
                next_seq: 0,
                queue: VecDeque::new(),
                in_flight: VecDeque::new(),
            }),
            events,
            connected: AtomicBool::new(false),
        });

        let (ctrl, ctrl_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(inner.clone(), ctrl_rx));

        Self { inner, ctrl }
    }

    /// Request a connection. Re-enables auto-reconnect.
    pub fn connect(&self) {
        let _ = self.ctrl.send(Control::Connect);
    }

    /// Close the link and disable auto-reconnect.
    pub fn disconnect(&self) {
        let _ = self.ctrl.send(Control::Disconnect);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn prefix(&self) -> &str {
        &self.inner.config.prefix
    }

    /// Subscribe to channel notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Submit a command.
    ///
    /// While disconnected the callback fails immediately with no device
    /// error code; a full queue rejects the command with an [`ChannelEvent::Overflow`]
    /// notification before the failure callback. Otherwise the command joins
    /// the FIFO queue under the next sequence number.
    pub async fn send(&self, command: impl Into<String>, callback: ResponseCallback) {
        let command = command.into();
        let mut st = self.inner.state.lock().await;

        if !st.link_up {
            drop(st);
            tracing::debug!(
                "channel[{}]: cannot send '{}': not connected",
                self.inner.config.prefix,
                command
            );
            callback(CommandReply::failure(command));
            return;
        }

        if st.queue.len() >= self.inner.config.max_queue_size {
            drop(st);
            tracing::warn!(
                "channel[{}]: queue full ({}), rejecting '{}'",
                self.inner.config.prefix,
                self.inner.config.max_queue_size,
                command
            );
            let _ = self.inner.events.send(ChannelEvent::Overflow {
                command: command.clone(),
            });
            callback(CommandReply::failure(command));
            return;
        }

        let seq = st.next_seq;
        st.next_seq += 1;
        st.queue.push_back(QueuedCommand {
            command,
            seq,
            callback,
            queued_at: Instant::now(),
        });
    }

    /// Number of commands currently queued (not yet dispatched).
    pub async fn queued_len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }
}

/// Channel task: multiplexes control requests, link events, the drain tick
/// and per-command timeouts on one logical thread.
async fn run(inner: Arc<Inner>, mut ctrl_rx: mpsc::UnboundedReceiver<Control>) {
    let mut link_rx: Option<mpsc::Receiver<LinkEvent>> = None;
    let mut timeouts: DelayQueue<u64> = DelayQueue::new();
    let mut reconnect: Option<Pin<Box<Sleep>>> = None;

    let mut drain = time::interval(inner.config.queue_process_interval);
    drain.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            ctrl = ctrl_rx.recv() => match ctrl {
                Some(Control::Connect) => {
                    reconnect = None;
                    try_connect(&inner, &mut link_rx, &mut reconnect).await;
                }
                Some(Control::Disconnect) => {
                    {
                        let mut st = inner.state.lock().await;
                        st.auto_reconnect = false;
                    }
                    reconnect = None;
                    inner.transport.disconnect().await;
                    handle_link_down(&inner, &mut link_rx, &mut timeouts, &mut reconnect).await;
                }
                None => break,
            },

            ev = async { link_rx.as_mut().expect("guarded").recv().await }, if link_rx.is_some() => {
                match ev {
                    Some(LinkEvent::Message { topic, payload }) => {
                        handle_message(&inner, &mut timeouts, &topic, &payload).await;
                    }
                    Some(LinkEvent::Down { reason }) => {
                        tracing::warn!("channel[{}]: link dropped: {}", inner.config.prefix, reason);
                        handle_link_down(&inner, &mut link_rx, &mut timeouts, &mut reconnect).await;
                    }
                    None => {
                        // Transport pump ended without a Down notification.
                        handle_link_down(&inner, &mut link_rx, &mut timeouts, &mut reconnect).await;
                    }
                }
            },

            _ = drain.tick() => {
                drain_one(&inner, &mut timeouts).await;
            }

            Some(expired) = timeouts.next(), if !timeouts.is_empty() => {
                handle_timeout(&inner, expired.into_inner()).await;
            }

            _ = async { reconnect.as_mut().expect("guarded").await }, if reconnect.is_some() => {
                reconnect = None;
                tracing::info!("channel[{}]: attempting reconnect", inner.config.prefix);
                try_connect(&inner, &mut link_rx, &mut reconnect).await;
            }
        }
    }
}

async fn try_connect(
    inner: &Arc<Inner>,
    link_rx: &mut Option<mpsc::Receiver<LinkEvent>>,
    reconnect: &mut Option<Pin<Box<Sleep>>>,
) {
    {
        let mut st = inner.state.lock().await;
        if st.link_up {
            tracing::warn!("channel[{}]: already connected", inner.config.prefix);
            return;
        }
        st.auto_reconnect = true;
    }

    tracing::info!("channel[{}]: connecting", inner.config.prefix);
    match inner.transport.connect().await {
        Ok(rx) => {
            if let Err(e) = inner.transport.subscribe(&inner.echo_topic).await {
                tracing::error!(
                    "channel[{}]: subscribe to {} failed: {}",
                    inner.config.prefix,
                    inner.echo_topic,
                    e
                );
                inner.transport.disconnect().await;
                let _ = inner.events.send(ChannelEvent::LinkError(e.to_string()));
                schedule_reconnect(inner, reconnect).await;
                return;
            }

            *link_rx = Some(rx);
            inner.state.lock().await.link_up = true;
            inner.connected.store(true, Ordering::SeqCst);
            tracing::info!("channel[{}]: connected", inner.config.prefix);
            let _ = inner.events.send(ChannelEvent::Connected);
        }
        Err(e) => {
            tracing::error!("channel[{}]: connect failed: {}", inner.config.prefix, e);
            let _ = inner.events.send(ChannelEvent::LinkError(e.to_string()));
            schedule_reconnect(inner, reconnect).await;
        }
    }
}

async fn schedule_reconnect(inner: &Arc<Inner>, reconnect: &mut Option<Pin<Box<Sleep>>>) {
    if inner.state.lock().await.auto_reconnect {
        tracing::info!(
            "channel[{}]: reconnecting in {:?}",
            inner.config.prefix,
            inner.config.reconnect_interval
        );
        *reconnect = Some(Box::pin(time::sleep(inner.config.reconnect_interval)));
    }
}

/// Tear the link state down: fail every queued and in-flight command, reset
/// the sequence counter, and arm the reconnect timer when allowed.
async fn handle_link_down(
    inner: &Arc<Inner>,
    link_rx: &mut Option<mpsc::Receiver<LinkEvent>>,
    timeouts: &mut DelayQueue<u64>,
    reconnect: &mut Option<Pin<Box<Sleep>>>,
) {
    *link_rx = None;
    let was_up = inner.connected.swap(false, Ordering::SeqCst);

    let (in_flight, queued, auto) = {
        let mut st = inner.state.lock().await;
        if !st.link_up && !was_up {
            return;
        }
        st.link_up = false;
        st.next_seq = 0;
        (
            std::mem::take(&mut st.in_flight),
            std::mem::take(&mut st.queue),
            st.auto_reconnect,
        )
    };

    timeouts.clear();

    let flushed = in_flight.len() + queued.len();
    for sent in in_flight {
        (sent.callback)(CommandReply::failure(sent.command));
    }
    for queued_cmd in queued {
        (queued_cmd.callback)(CommandReply::failure(queued_cmd.command));
    }
    if flushed > 0 {
        tracing::warn!(
            "channel[{}]: flushed {} outstanding command(s) on disconnect",
            inner.config.prefix,
            flushed
        );
    }

    let _ = inner.events.send(ChannelEvent::Disconnected);

    if auto {
        schedule_reconnect(inner, reconnect).await;
    }
}

/// Dispatch the oldest queued command, if any.
async fn drain_one(inner: &Arc<Inner>, timeouts: &mut DelayQueue<u64>) {
    let popped = {
        let mut st = inner.state.lock().await;
        if !st.link_up {
            return;
        }
        match st.queue.pop_front() {
            Some(cmd) => cmd,
            None => return,
        }
    };

    tracing::debug!(
        "channel[{}]: publishing '{}' (seq {}, queued {:?})",
        inner.config.prefix,
        popped.command,
        popped.seq,
        popped.queued_at.elapsed()
    );

    match inner
        .transport
        .publish(&inner.cmd_topic, popped.command.clone().into_bytes())
        .await
    {
        Ok(()) => {
            let mut st = inner.state.lock().await;
            if !st.link_up {
                // The link dropped while publishing; everything else was
                // already flushed, so fail this one too.
                drop(st);
                (popped.callback)(CommandReply::failure(popped.command));
                return;
            }
            let timeout_key = timeouts.insert(popped.seq, inner.config.command_timeout);
            st.in_flight.push_back(SentCommand {
                command: popped.command,
                seq: popped.seq,
                callback: popped.callback,
                sent_at: Instant::now(),
                timeout_key,
            });
        }
        Err(e) => {
            tracing::error!(
                "channel[{}]: publish of '{}' failed: {}",
                inner.config.prefix,
                popped.command,
                e
            );
            (popped.callback)(CommandReply::failure(popped.command));
        }
    }
}

/// Correlate an inbound echo with the oldest in-flight command of the same
/// text, or surface it as an unsolicited update.
async fn handle_message(
    inner: &Arc<Inner>,
    timeouts: &mut DelayQueue<u64>,
    topic: &str,
    payload: &[u8],
) {
    if !topic.ends_with("/echo") {
        tracing::warn!("channel[{}]: message on unexpected topic {}", inner.config.prefix, topic);
        return;
    }

    let text = String::from_utf8_lossy(payload);
    let frame = match protocol::parse_echo(&text) {
        Some(frame) => frame,
        None => {
            tracing::warn!(
                "channel[{}]: discarding unparseable echo: {}",
                inner.config.prefix,
                text
            );
            return;
        }
    };

    let code = value::as_error_code(&frame.value);

    // Oldest-in-flight-wins correlation. This assumes the broker preserves
    // per-topic ordering; if echoes for identical command text arrive out of
    // order, a stale reply can resolve the wrong (newer) request.
    let resolved = {
        let mut st = inner.state.lock().await;
        let idx = st
            .in_flight
            .iter()
            .position(|sent| sent.command == frame.command);
        idx.and_then(|idx| st.in_flight.remove(idx))
    };

    match resolved {
        Some(sent) => {
            timeouts.try_remove(&sent.timeout_key);
            let success = code.is_none_or(|c| c == 0);
            let error_code = code.unwrap_or(-1);
            tracing::debug!(
                "channel[{}]: '{}' (seq {}) answered in {:?}",
                inner.config.prefix,
                sent.command,
                sent.seq,
                sent.sent_at.elapsed()
            );
            (sent.callback)(CommandReply {
                command: frame.command,
                value: frame.value,
                success,
                error_code,
            });
        }
        None => {
            tracing::debug!(
                "channel[{}]: unsolicited echo for '{}'",
                inner.config.prefix,
                frame.command
            );
            let _ = inner.events.send(ChannelEvent::Unsolicited {
                command: frame.command,
                value: frame.value,
                error_code: code,
            });
        }
    }
}

/// Fail a command whose echo window elapsed.
async fn handle_timeout(inner: &Arc<Inner>, seq: u64) {
    let expired = {
        let mut st = inner.state.lock().await;
        let idx = st.in_flight.iter().position(|sent| sent.seq == seq);
        idx.and_then(|idx| st.in_flight.remove(idx))
    };

    if let Some(sent) = expired {
        tracing::warn!(
            "channel[{}]: '{}' (seq {}) timed out after {:?}",
            inner.config.prefix,
            sent.command,
            sent.seq,
            inner.config.command_timeout
        );
        (sent.callback)(CommandReply::failure(sent.command));
    }
}
