//! capsync hub — accepts capture nodes and drives them.
//!
//! ```text
//! capsync-hub                    Run in the foreground
//! capsync-hub --config <path>    Load a custom config TOML
//! capsync-hub --port <port>      Override the listening port
//! capsync-hub --gen-config       Write default config to stdout
//! ```

mod config;

use std::path::PathBuf;
use std::time::Duration;

use capsync_core::{CommandType, CoordinatorEvent, DeviceCoordinator, MarkerType, Message};
use clap::Parser;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use config::HubConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "capsync-hub", about = "capsync coordinator hub")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "capsync-hub.toml")]
    config: PathBuf,

    /// Override the listening port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&HubConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = HubConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.coordinator.network.port = port;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("capsync-hub v{}", env!("CARGO_PKG_VERSION"));
    info!("hub id: {}", config.coordinator.local_id);
    info!("listening on {}", config.coordinator.network.bind_socket());
    info!(
        "heartbeat every {} ms",
        config.coordinator.timing.heartbeat_interval_ms
    );

    let schedule = config.schedule.clone();
    let (hub, mut events) = DeviceCoordinator::server(config.coordinator)?;
    hub.start().await?;

    let mut status_poll = ticker(schedule.status_poll_interval_ms);
    let mut markers = ticker(schedule.marker_interval_ms);
    let mut resync = ticker(schedule.resync_interval_ms);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
            _ = tick(&mut status_poll) => {
                let reached = hub
                    .broadcast_command(CommandType::StatusQuery, &schedule.session_id, Vec::new())
                    .await;
                debug!(reached, "status query broadcast");
            }
            _ = tick(&mut markers) => {
                hub.broadcast_marker(MarkerType::Periodic, &schedule.session_id).await;
            }
            _ = tick(&mut resync) => {
                let sent = hub.sync_with_all().await;
                debug!(sent, "periodic clock sync");
            }
        }
    }

    for record in hub.endpoints() {
        info!(
            endpoint = %record.id,
            liveness = %record.liveness,
            offset_ms = record.clock_offset_millis,
            "connected at shutdown"
        );
    }
    hub.stop().await;
    Ok(())
}

/// A delayed ticker, or `None` when the period is 0.
fn ticker(period_ms: u64) -> Option<Interval> {
    if period_ms == 0 {
        return None;
    }
    let period = Duration::from_millis(period_ms);
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_event(event: &CoordinatorEvent) {
    match event {
        CoordinatorEvent::DeviceConnected { endpoint_id } => {
            info!(endpoint = %endpoint_id, "device connected");
        }
        CoordinatorEvent::DeviceDisconnected { endpoint_id, reason } => {
            info!(endpoint = %endpoint_id, %reason, "device disconnected");
        }
        CoordinatorEvent::MessageReceived { endpoint_id, message } => match message {
            Message::Response(resp) if resp.kind == CommandType::StatusQuery => {
                info!(
                    endpoint = %endpoint_id,
                    battery = resp.data.first().map(String::as_str).unwrap_or("?"),
                    storage = resp.data.get(1).map(String::as_str).unwrap_or("?"),
                    streams = resp.data.get(2).map(String::as_str).unwrap_or(""),
                    "status report"
                );
            }
            Message::Response(resp) => {
                info!(
                    endpoint = %endpoint_id,
                    kind = %resp.kind,
                    status = %resp.status,
                    message = %resp.message,
                    "response"
                );
            }
            other => debug!(endpoint = %endpoint_id, kind = %other.kind(), "message"),
        },
        CoordinatorEvent::SyncCompleted {
            endpoint_id,
            offset_millis,
            round_trip_millis,
        } => {
            info!(
                endpoint = %endpoint_id,
                offset_ms = offset_millis,
                rtt_ms = round_trip_millis,
                "clock synced"
            );
        }
        CoordinatorEvent::ConnectionLost { endpoint_id } => {
            warn!(endpoint = %endpoint_id, "connection lost");
        }
        CoordinatorEvent::ConnectionRecovered { endpoint_id } => {
            info!(endpoint = %endpoint_id, "connection recovered");
        }
        CoordinatorEvent::ConnectionPermanentlyLost { endpoint_id } => {
            warn!(endpoint = %endpoint_id, "connection permanently lost, evicted");
        }
        CoordinatorEvent::Error {
            endpoint_id,
            description,
        } => {
            warn!(endpoint = %endpoint_id, error = %description, "transport error");
        }
    }
}
