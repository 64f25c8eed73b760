// MIT License - Copyright (c) 2026 Peter Wright
// Alarm gateway host

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use alarm_gateway::{BusEvent, GatewayConfig, MessageType, registry};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "alarm-gateway")]
#[command(about = "Receive alarm panel events and forward them to senders")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "gateway.toml")]
    config: String,
}

fn load_config(path: &str) -> Result<GatewayConfig> {
    GatewayConfig::load(path).with_context(|| format!("Failed to load config file {path}"))
}

// ---------------------------------------------------------------------------
// Bus event logging
// ---------------------------------------------------------------------------

fn spawn_event_logger(mut rx: alarm_gateway::EventReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(BusEvent::MessageReceived { origin, message }) => match message.kind {
                    MessageType::Event => info!("{origin}: {message} from {}", message.source),
                    _ => debug!("{origin}: {message} from {}", message.source),
                },
                Ok(BusEvent::MessageSent { message }) => {
                    debug!("Message {} delivered to all senders", message.id);
                }
                Ok(BusEvent::Error { origin, error }) => {
                    error!("{origin}: {error}");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event receiver lagged, missed {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    info!("Event channel closed");
                    break;
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=alarm_gateway=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let mut bus = registry::build_bus(&config).context("Failed to build gateway")?;
        let logger = spawn_event_logger(bus.subscribe());
        bus.start().await.context("Failed to start receivers")?;

        info!("Gateway running. Send SIGHUP to reload, SIGINT/SIGTERM to stop.");
        let restart = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                false
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading config and restarting receivers...");
                true
            }
        };

        bus.stop().await;
        bus.clear();
        drop(bus);
        logger.abort();

        if !restart {
            break;
        }

        // Reload config from disk; keep previous config on failure
        info!("Reloading config from {}", cli.config);
        match load_config(&cli.config) {
            Ok(new_config) => {
                config = new_config;
                info!("Config reloaded successfully");
            }
            Err(e) => warn!("Failed to reload config, keeping previous: {e:#}"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}
