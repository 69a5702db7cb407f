//! MQTT device simulator.
//!
//! Serves one or more controller prefixes on a broker: subscribes each
//! `<prefix>/cmd` topic and answers configured commands on `<prefix>/echo`
//! after a configurable delay, in the same echo grammar the real controllers
//! use. Commands without a configured answer get no echo, which exercises
//! the monitor's timeout path.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};

use config::SimulatorConfig;

/// Observatory controller simulator.
#[derive(Parser, Debug)]
#[command(name = "skymon-sim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the simulator configuration file; built-in defaults when
    /// omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "skymon_sim=debug"
    } else {
        "skymon_sim=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();

    let config = match &args.config {
        Some(path) => SimulatorConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            tracing::info!("no configuration given, using built-in defaults");
            SimulatorConfig::default()
        }
    };
    config.validate().context("invalid simulator configuration")?;
    let config = Arc::new(config);

    tracing::info!(
        "simulating {} controller(s) on {}:{}",
        config.controllers.len(),
        config.mqtt.host,
        config.mqtt.port
    );
    for ctrl in &config.controllers {
        tracing::info!(
            "  prefix {} with {} command(s)",
            ctrl.prefix,
            ctrl.commands.len()
        );
    }

    let client_id = format!("skymon_sim_{}", uuid::Uuid::new_v4());
    let mut opts = MqttOptions::new(client_id, &config.mqtt.host, config.mqtt.port);
    opts.set_keep_alive(Duration::from_secs(60));
    if let (Some(username), Some(password)) = (&config.mqtt.username, &config.mqtt.password) {
        opts.set_credentials(username, password);
    }

    let (client, mut event_loop) = AsyncClient::new(opts, 64);

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("connected to broker");
                // (Re)subscribe every command topic on each session.
                for ctrl in &config.controllers {
                    let topic = format!("{}/cmd", ctrl.prefix);
                    if let Err(e) = client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                        tracing::error!("subscribe to {} failed: {}", topic, e);
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                handle_command(&config, &client, &p.topic, &p.payload);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("mqtt error: {}, retrying", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Answer one inbound command, if it is configured.
fn handle_command(config: &Arc<SimulatorConfig>, client: &AsyncClient, topic: &str, payload: &[u8]) {
    let Some(prefix) = topic.strip_suffix("/cmd") else {
        tracing::warn!("message on unexpected topic {}", topic);
        return;
    };

    let command = String::from_utf8_lossy(payload).to_string();
    let Some(response) = config.find_response(prefix, &command) else {
        tracing::warn!("{}: no response configured for '{}'", prefix, command);
        return;
    };

    let echo_topic = format!("{}/echo", prefix);
    let echo = format!(
        "Received: {}, Response: {}#, Source: MQTT",
        command, response.response
    );
    let delay = Duration::from_millis(response.delay_ms);
    let client = client.clone();
    let prefix = prefix.to_string();

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        tracing::debug!("{}: {} -> {}", prefix, command, echo);
        if let Err(e) = client
            .publish(echo_topic.as_str(), QoS::AtMostOnce, false, echo.into_bytes())
            .await
        {
            tracing::error!("{}: echo publish failed: {}", prefix, e);
        }
    });
}
