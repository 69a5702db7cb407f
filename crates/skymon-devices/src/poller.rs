//! Dual-cadence command poller.
//!
//! Issues a controller type's fast and slow command sets against one command
//! channel, keeps a timestamped cache of the latest value per command, and
//! flags entries whose age exceeds their cadence-scaled staleness threshold.
//! Polling survives reconnects: timers stop while the link is down and the
//! wants-to-poll flag restarts them as soon as the channel comes back.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};

use skymon_core::CachedValue;
use skymon_core::value;

use crate::channel::{ChannelEvent, CommandChannel, CommandReply, ResponseCallback};
use crate::commands::{CommandSet, command_set_for};

/// Cadence of the fixed staleness scan.
const STALE_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Notifications emitted by a poller.
#[derive(Debug, Clone)]
pub enum PollEvent {
    /// A value was refreshed by a poll or an unsolicited push.
    DataUpdated { command: String, value: String },
    /// A cached value exceeded its staleness threshold.
    DataStale { command: String },
    /// A poll attempt failed; any cached value was marked invalid.
    PollError { command: String, error: String },
}

enum PollControl {
    Start { fast: Duration, slow: Duration },
    Stop,
}

struct PollerInner {
    name: String,
    channel: CommandChannel,
    set: CommandSet,
    stale_multiplier: u32,
    /// Current (fast, slow) cadence.
    cadence: Mutex<(Duration, Duration)>,
    cache: Mutex<HashMap<String, CachedValue>>,
    wants_poll: AtomicBool,
    polls_ok: AtomicU64,
    polls_failed: AtomicU64,
    events: broadcast::Sender<PollEvent>,
}

impl PollerInner {
    fn stale_threshold(&self, command: &str) -> Duration {
        let (fast, slow) = *self.cadence.lock();
        let interval = if self.set.is_fast(command) { fast } else { slow };
        interval * self.stale_multiplier
    }

    fn is_stale(&self, command: &str) -> bool {
        let cache = self.cache.lock();
        match cache.get(command) {
            None => true,
            Some(entry) if !entry.valid => true,
            Some(entry) => entry.age() > self.stale_threshold(command),
        }
    }
}

/// Poller handle bound to one command channel.
pub struct Poller {
    inner: Arc<PollerInner>,
    ctrl: mpsc::UnboundedSender<PollControl>,
}

impl Poller {
    /// Create a poller for the given controller type and start its task.
    pub fn new(
        name: impl Into<String>,
        controller_type: &str,
        channel: CommandChannel,
        stale_multiplier: u32,
    ) -> Self {
        let chan_rx = channel.subscribe_events();
        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(PollerInner {
            name: name.into(),
            channel,
            set: command_set_for(controller_type),
            stale_multiplier,
            cadence: Mutex::new((Duration::from_secs(1), Duration::from_secs(10))),
            cache: Mutex::new(HashMap::new()),
            wants_poll: AtomicBool::new(false),
            polls_ok: AtomicU64::new(0),
            polls_failed: AtomicU64::new(0),
            events,
        });

        let (ctrl, ctrl_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(inner.clone(), ctrl_rx, chan_rx));

        Self { inner, ctrl }
    }

    /// Begin polling at the given cadence. If the channel is not yet
    /// connected, polling starts automatically once it is.
    pub fn start(&self, fast: Duration, slow: Duration) {
        let _ = self.ctrl.send(PollControl::Start { fast, slow });
    }

    /// Stop polling and clear the wants-to-poll flag.
    pub fn stop(&self) {
        let _ = self.ctrl.send(PollControl::Stop);
    }

    pub fn is_polling(&self) -> bool {
        self.inner.wants_poll.load(Ordering::SeqCst)
    }

    /// Latest cached entry for a command, if one was ever received.
    pub fn cached_value(&self, command: &str) -> Option<CachedValue> {
        self.inner.cache.lock().get(command).cloned()
    }

    /// Snapshot of the whole cache.
    pub fn all_cached_values(&self) -> HashMap<String, CachedValue> {
        self.inner.cache.lock().clone()
    }

    /// True for unknown commands, invalidated entries, and entries older
    /// than their cadence-scaled threshold.
    pub fn is_data_stale(&self, command: &str) -> bool {
        self.inner.is_stale(command)
    }

    pub fn successful_polls(&self) -> u64 {
        self.inner.polls_ok.load(Ordering::Relaxed)
    }

    pub fn failed_polls(&self) -> u64 {
        self.inner.polls_failed.load(Ordering::Relaxed)
    }

    /// Subscribe to poll notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PollEvent> {
        self.inner.events.subscribe()
    }
}

/// Poller task: multiplexes the cadence timers, the staleness scan, channel
/// notifications and control requests.
async fn run(
    inner: Arc<PollerInner>,
    mut ctrl_rx: mpsc::UnboundedReceiver<PollControl>,
    mut chan_rx: broadcast::Receiver<ChannelEvent>,
) {
    let mut fast_timer = new_interval(Duration::from_secs(1));
    let mut slow_timer = new_interval(Duration::from_secs(10));
    let mut stale_timer = new_interval(STALE_SCAN_INTERVAL);
    let mut armed = false;

    loop {
        tokio::select! {
            ctrl = ctrl_rx.recv() => match ctrl {
                Some(PollControl::Start { fast, slow }) => {
                    *inner.cadence.lock() = (fast, slow);
                    if inner.wants_poll.swap(true, Ordering::SeqCst) {
                        // Already polling: pick up the new cadence on the
                        // running timers without an extra immediate round.
                        tracing::warn!("poller[{}]: already polling", inner.name);
                        if armed {
                            arm_timers(&mut fast_timer, &mut slow_timer, &mut stale_timer, fast, slow);
                        }
                        continue;
                    }
                    tracing::info!(
                        "poller[{}]: starting (fast {:?}, slow {:?})",
                        inner.name, fast, slow
                    );
                    if inner.channel.is_connected() {
                        poll_round(&inner).await;
                        arm_timers(&mut fast_timer, &mut slow_timer, &mut stale_timer, fast, slow);
                        armed = true;
                    } else {
                        tracing::info!("poller[{}]: waiting for connection", inner.name);
                    }
                }
                Some(PollControl::Stop) => {
                    if inner.wants_poll.swap(false, Ordering::SeqCst) {
                        tracing::info!("poller[{}]: stopping", inner.name);
                    }
                    armed = false;
                }
                None => break,
            },

            ev = chan_rx.recv() => match ev {
                Ok(ChannelEvent::Connected) => {
                    if inner.wants_poll.load(Ordering::SeqCst) {
                        tracing::info!("poller[{}]: channel connected, resuming", inner.name);
                        let (fast, slow) = *inner.cadence.lock();
                        poll_round(&inner).await;
                        arm_timers(&mut fast_timer, &mut slow_timer, &mut stale_timer, fast, slow);
                        armed = true;
                    }
                }
                Ok(ChannelEvent::Disconnected) => {
                    tracing::warn!("poller[{}]: channel disconnected, timers stopped", inner.name);
                    armed = false;
                    invalidate_all(&inner);
                }
                Ok(ChannelEvent::Unsolicited { command, value, error_code }) => {
                    handle_unsolicited(&inner, command, value, error_code);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("poller[{}]: lagged, dropped {} channel events", inner.name, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            _ = fast_timer.tick(), if armed => {
                poll_set(&inner, true).await;
            }

            _ = slow_timer.tick(), if armed => {
                poll_set(&inner, false).await;
            }

            _ = stale_timer.tick(), if armed => {
                scan_stale(&inner);
            }
        }
    }
}

fn new_interval(period: Duration) -> Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Restart all three timers so the first tick lands one full period out (the
/// caller has just issued an immediate round).
fn arm_timers(
    fast_timer: &mut Interval,
    slow_timer: &mut Interval,
    stale_timer: &mut Interval,
    fast: Duration,
    slow: Duration,
) {
    let now = Instant::now();
    *fast_timer = interval_starting_at(now + fast, fast);
    *slow_timer = interval_starting_at(now + slow, slow);
    *stale_timer = interval_starting_at(now + STALE_SCAN_INTERVAL, STALE_SCAN_INTERVAL);
}

fn interval_starting_at(start: Instant, period: Duration) -> Interval {
    let mut interval = time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// One immediate round of both command sets.
async fn poll_round(inner: &Arc<PollerInner>) {
    poll_set(inner, true).await;
    poll_set(inner, false).await;
}

async fn poll_set(inner: &Arc<PollerInner>, fast: bool) {
    let commands = if fast {
        inner.set.fast.clone()
    } else {
        inner.set.slow.clone()
    };
    for command in commands {
        tracing::debug!(
            "poller[{}]: polling {} command {}",
            inner.name,
            if fast { "fast" } else { "slow" },
            command
        );
        inner.channel.send(command, poll_callback(inner)).await;
    }
}

fn poll_callback(inner: &Arc<PollerInner>) -> ResponseCallback {
    let inner = inner.clone();
    Box::new(move |reply| handle_poll_reply(&inner, reply))
}

fn handle_poll_reply(inner: &Arc<PollerInner>, reply: CommandReply) {
    if reply.success {
        inner.polls_ok.fetch_add(1, Ordering::Relaxed);
        inner
            .cache
            .lock()
            .insert(reply.command.clone(), CachedValue::new(reply.value.clone()));
        tracing::debug!("poller[{}]: {} = {}", inner.name, reply.command, reply.value);
        let _ = inner.events.send(PollEvent::DataUpdated {
            command: reply.command,
            value: reply.value,
        });
    } else {
        inner.polls_failed.fetch_add(1, Ordering::Relaxed);
        let error = if reply.error_code > 0 {
            format!(
                "device error {}: {}",
                reply.error_code,
                value::error_code_meaning(reply.error_code)
            )
        } else {
            "timeout or connection issue".to_string()
        };
        tracing::warn!(
            "poller[{}]: poll of {} failed: {}",
            inner.name,
            reply.command,
            error
        );
        if let Some(entry) = inner.cache.lock().get_mut(&reply.command) {
            entry.valid = false;
        }
        let _ = inner.events.send(PollEvent::PollError {
            command: reply.command,
            error,
        });
    }
}

/// Device-pushed update outside the poll cadence.
fn handle_unsolicited(
    inner: &Arc<PollerInner>,
    command: String,
    value_text: String,
    error_code: Option<i32>,
) {
    match error_code {
        Some(code) if code != 0 => {
            let error = format!("device error {}: {}", code, value::error_code_meaning(code));
            tracing::warn!("poller[{}]: unsolicited {} for {}", inner.name, error, command);
            if let Some(entry) = inner.cache.lock().get_mut(&command) {
                entry.valid = false;
            }
            let _ = inner.events.send(PollEvent::PollError { command, error });
        }
        _ => {
            tracing::debug!("poller[{}]: pushed update {} = {}", inner.name, command, value_text);
            inner
                .cache
                .lock()
                .insert(command.clone(), CachedValue::new(value_text.clone()));
            let _ = inner.events.send(PollEvent::DataUpdated {
                command,
                value: value_text,
            });
        }
    }
}

/// Mark every cached entry invalid, keeping the last known values.
fn invalidate_all(inner: &Arc<PollerInner>) {
    let mut cache = inner.cache.lock();
    for entry in cache.values_mut() {
        entry.valid = false;
    }
}

/// Emit a stale notification for every entry past its threshold.
fn scan_stale(inner: &Arc<PollerInner>) {
    let commands: Vec<String> = inner.cache.lock().keys().cloned().collect();
    for command in commands {
        if inner.is_stale(&command) {
            tracing::debug!("poller[{}]: data for {} is stale", inner.name, command);
            let _ = inner.events.send(PollEvent::DataStale { command });
        }
    }
}
