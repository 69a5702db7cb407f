//! Poller behavior: cadence, caching, staleness, reconnect resumption.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use common::MockTransport;
use skymon_devices::channel::{ChannelConfig, CommandChannel};
use skymon_devices::poller::{PollEvent, Poller};

/// Short drain and echo window so polls settle quickly under the paused clock.
fn quick_config() -> ChannelConfig {
    let mut config = ChannelConfig::new("OCS");
    config.queue_process_interval = Duration::from_millis(10);
    config.command_timeout = Duration::from_millis(500);
    config
}

/// Observatory-type poller over a responding mock device.
async fn polling_setup() -> (MockTransport, CommandChannel, Poller) {
    let mock = MockTransport::new();
    mock.set_response(":DZ#", "306.640");
    mock.set_response(":RS#", "OPEN");

    let channel = CommandChannel::new(quick_config(), Arc::new(mock.clone()));
    let poller = Poller::new("Observatory", "observatory", channel.clone(), 3);

    channel.connect();
    time::sleep(Duration::from_millis(10)).await;
    assert!(channel.is_connected());

    (mock, channel, poller)
}

#[tokio::test(start_paused = true)]
async fn start_issues_immediate_round_and_fills_cache() {
    let (mock, _channel, poller) = polling_setup().await;
    let mut events = poller.subscribe_events();

    poller.start(Duration::from_secs(1), Duration::from_secs(10));
    time::sleep(Duration::from_millis(100)).await;

    assert_eq!(mock.publish_count(":DZ#"), 1);
    assert_eq!(mock.publish_count(":RS#"), 1);

    let dz = poller.cached_value(":DZ#").expect("fast command cached");
    assert_eq!(dz.value, "306.640");
    assert!(dz.valid);
    let rs = poller.cached_value(":RS#").expect("slow command cached");
    assert_eq!(rs.value, "OPEN");
    assert!(rs.valid);
    assert!(!poller.is_data_stale(":DZ#"));
    assert_eq!(poller.successful_polls(), 2);

    let mut updated = Vec::new();
    while let Ok(ev) = events.try_recv() {
        if let PollEvent::DataUpdated { command, .. } = ev {
            updated.push(command);
        }
    }
    assert!(updated.contains(&":DZ#".to_string()));
    assert!(updated.contains(&":RS#".to_string()));
}

#[tokio::test(start_paused = true)]
async fn fast_and_slow_sets_poll_at_their_own_cadence() {
    let (mock, _channel, poller) = polling_setup().await;

    poller.start(Duration::from_secs(1), Duration::from_secs(10));
    time::sleep(Duration::from_millis(100)).await;

    // One fast period later the fast set repolls, the slow set does not.
    time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(mock.publish_count(":DZ#"), 2);
    assert_eq!(mock.publish_count(":RS#"), 1);

    // After the slow period both have run again.
    time::sleep(Duration::from_millis(9000)).await;
    assert!(mock.publish_count(":DZ#") >= 10);
    assert_eq!(mock.publish_count(":RS#"), 2);
}

#[tokio::test(start_paused = true)]
async fn poll_failure_invalidates_but_keeps_last_value() {
    let (mock, _channel, poller) = polling_setup().await;
    let mut events = poller.subscribe_events();

    poller.start(Duration::from_secs(1), Duration::from_secs(10));
    time::sleep(Duration::from_millis(100)).await;

    // Device stops answering the fast command; the next poll times out.
    mock.clear_response(":DZ#");
    time::sleep(Duration::from_millis(1700)).await;

    let dz = poller.cached_value(":DZ#").unwrap();
    assert_eq!(dz.value, "306.640", "stale value is retained for display");
    assert!(!dz.valid);
    assert!(poller.is_data_stale(":DZ#"));
    assert!(poller.failed_polls() >= 1);

    let mut saw_poll_error = false;
    while let Ok(ev) = events.try_recv() {
        if let PollEvent::PollError { command, .. } = ev {
            assert_eq!(command, ":DZ#");
            saw_poll_error = true;
        }
    }
    assert!(saw_poll_error);
}

#[tokio::test(start_paused = true)]
async fn staleness_boundary_is_cadence_times_multiplier() {
    let (_mock, _channel, poller) = polling_setup().await;

    poller.start(Duration::from_secs(1), Duration::from_secs(10));
    time::sleep(Duration::from_millis(100)).await;
    // Freeze the cache by stopping the poller; entries age from here on.
    poller.stop();
    time::sleep(Duration::from_millis(10)).await;
    assert!(!poller.is_polling());

    // Fast threshold is 1s x 3. Just inside: still fresh.
    time::sleep(Duration::from_millis(2700)).await;
    assert!(!poller.is_data_stale(":DZ#"));

    // Just past: stale. The slow entry (10s x 3) is still fresh.
    time::sleep(Duration::from_millis(500)).await;
    assert!(poller.is_data_stale(":DZ#"));
    assert!(!poller.is_data_stale(":RS#"));

    // Unknown commands always read as stale.
    assert!(poller.is_data_stale(":GZ#"));
}

#[tokio::test(start_paused = true)]
async fn stale_scan_emits_notifications() {
    let (mock, _channel, poller) = polling_setup().await;
    let mut events = poller.subscribe_events();

    poller.start(Duration::from_secs(1), Duration::from_secs(10));
    time::sleep(Duration::from_millis(100)).await;

    // The fast command stops answering and goes invalid; the 5s scan then
    // reports it. The slow command stays well inside its 30s threshold.
    mock.clear_response(":DZ#");
    time::sleep(Duration::from_millis(5200)).await;

    let mut stale = Vec::new();
    while let Ok(ev) = events.try_recv() {
        if let PollEvent::DataStale { command } = ev {
            stale.push(command);
        }
    }
    assert!(stale.contains(&":DZ#".to_string()));
    assert!(!stale.contains(&":RS#".to_string()));
}

#[tokio::test(start_paused = true)]
async fn disconnect_invalidates_cache_and_polling_resumes_on_reconnect() {
    let (mock, channel, poller) = polling_setup().await;

    poller.start(Duration::from_secs(1), Duration::from_secs(10));
    time::sleep(Duration::from_millis(100)).await;
    let before = mock.publish_count(":DZ#");

    mock.drop_link("broker gone").await;
    time::sleep(Duration::from_millis(20)).await;

    assert!(!channel.is_connected());
    assert!(poller.is_polling(), "wants-to-poll survives the disconnect");
    let dz = poller.cached_value(":DZ#").unwrap();
    assert!(!dz.valid);
    assert_eq!(dz.value, "306.640");

    // The channel reconnects on its fixed delay and polling resumes without
    // any new start request.
    time::sleep(Duration::from_millis(10_300)).await;
    assert!(channel.is_connected());
    assert!(mock.publish_count(":DZ#") > before);
    let dz = poller.cached_value(":DZ#").unwrap();
    assert!(dz.valid);
}

#[tokio::test(start_paused = true)]
async fn start_while_disconnected_defers_until_connect() {
    let mock = MockTransport::new();
    mock.set_response(":DZ#", "306.640");
    mock.set_response(":RS#", "OPEN");
    let channel = CommandChannel::new(quick_config(), Arc::new(mock.clone()));
    let poller = Poller::new("Observatory", "observatory", channel.clone(), 3);

    poller.start(Duration::from_secs(1), Duration::from_secs(10));
    time::sleep(Duration::from_millis(50)).await;
    assert!(poller.is_polling());
    assert!(mock.published().is_empty(), "no polls before the link is up");

    channel.connect();
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.publish_count(":DZ#"), 1);
    assert_eq!(mock.publish_count(":RS#"), 1);
}

#[tokio::test(start_paused = true)]
async fn unsolicited_echo_updates_cache() {
    let (mock, _channel, poller) = polling_setup().await;
    let mut events = poller.subscribe_events();

    // No poll outstanding: a device-pushed value still lands in the cache.
    mock.inject_echo("OCS", ":GZ#", "120.500").await;
    time::sleep(Duration::from_millis(10)).await;

    let gz = poller.cached_value(":GZ#").expect("pushed value cached");
    assert_eq!(gz.value, "120.500");
    assert!(gz.valid);

    let mut saw_update = false;
    while let Ok(ev) = events.try_recv() {
        if let PollEvent::DataUpdated { command, value } = ev {
            assert_eq!(command, ":GZ#");
            assert_eq!(value, "120.500");
            saw_update = true;
        }
    }
    assert!(saw_update);
}

#[tokio::test(start_paused = true)]
async fn unsolicited_error_code_is_not_data() {
    let (mock, _channel, poller) = polling_setup().await;
    let mut events = poller.subscribe_events();

    mock.inject_echo("OCS", ":GW#", "5").await;
    time::sleep(Duration::from_millis(10)).await;

    assert!(poller.cached_value(":GW#").is_none(), "error codes are not cached");

    let mut saw_error = false;
    while let Ok(ev) = events.try_recv() {
        if let PollEvent::PollError { command, error } = ev {
            assert_eq!(command, ":GW#");
            assert!(error.contains("5"));
            saw_error = true;
        }
    }
    assert!(saw_error);
}
