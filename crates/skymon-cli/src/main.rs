//! Headless observatory monitor daemon.
//!
//! Loads the controller set from a YAML configuration file, connects every
//! enabled controller over the shared broker, starts polling, and logs the
//! monitor event stream until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use skymon_core::{EventBus, MonitorConfig, MonitorEvent};
use skymon_devices::ControllerManager;

/// Observatory controller monitor.
#[derive(Parser, Debug)]
#[command(name = "skymon")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the monitor against the configured controllers.
    Run {
        /// Path to the monitor configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Validate a configuration file and print the controller set.
    CheckConfig {
        /// Path to the monitor configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Write a default configuration file.
    InitConfig {
        /// Destination path.
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run { config } => run_monitor(config, args.verbose).await,
        Command::CheckConfig { config } => check_config(config),
        Command::InitConfig { config } => init_config(config),
    }
}

fn init_logging(debug: bool) {
    let default_filter = if debug { "skymon=debug" } else { "skymon=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let json_logging = std::env::var("SKYMON_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

async fn run_monitor(path: PathBuf, verbose: bool) -> Result<()> {
    let config = MonitorConfig::load_from_file(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate().context("invalid configuration")?;
    init_logging(verbose || config.logging.debug);

    tracing::info!(
        "skymon {} starting, broker {}:{}",
        skymon_core::VERSION,
        config.mqtt.host,
        config.mqtt.port
    );

    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let manager = ControllerManager::new(bus.clone());

    manager.load_from_config(&config).await;
    manager.connect_all().await;
    manager
        .start_polling(config.polling.fast_interval(), config.polling.slow_interval())
        .await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
            ev = events.recv() => match ev {
                Some((event, _meta)) => log_event(event),
                None => break,
            },
        }
    }

    manager.stop_polling().await;
    manager.disconnect_all().await;
    Ok(())
}

fn log_event(event: MonitorEvent) {
    match event {
        MonitorEvent::ControllerStatusChanged { controller, status } => {
            tracing::info!("{}: {}", controller, status);
        }
        MonitorEvent::ControllerEnabledChanged { controller, enabled } => {
            tracing::info!("{}: {}", controller, if enabled { "enabled" } else { "disabled" });
        }
        MonitorEvent::SystemStatusChanged { status } => {
            tracing::info!("system status: {}", status);
        }
        MonitorEvent::DataUpdated {
            controller,
            command,
            value,
        } => {
            tracing::debug!("{}: {} = {}", controller, command, value);
        }
        MonitorEvent::DataStale { controller, command } => {
            tracing::warn!("{}: {} is stale", controller, command);
        }
        MonitorEvent::PollError {
            controller,
            command,
            error,
        } => {
            tracing::warn!("{}: poll of {} failed: {}", controller, command, error);
        }
        MonitorEvent::ControllerError { controller, message } => {
            tracing::error!("{}: {}", controller, message);
        }
    }
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = MonitorConfig::load_from_file(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate().context("invalid configuration")?;

    println!("configuration OK: {}", path.display());
    println!("broker: {}:{}", config.mqtt.host, config.mqtt.port);
    println!(
        "timing: timeout {}s, reconnect {}s, fast {}ms, slow {}ms",
        config.mqtt.command_timeout_secs,
        config.mqtt.reconnect_interval_secs,
        config.polling.fast_poll_ms,
        config.polling.slow_poll_ms
    );
    println!("controllers:");
    for ctrl in &config.controllers {
        println!(
            "  - {} (type {}, prefix {}, {})",
            ctrl.name,
            ctrl.controller_type,
            ctrl.prefix,
            if ctrl.enabled { "enabled" } else { "disabled" }
        );
    }
    Ok(())
}

fn init_config(path: PathBuf) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    MonitorConfig::default()
        .save_to_file(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("wrote default configuration to {}", path.display());
    Ok(())
}
