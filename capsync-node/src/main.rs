//! capsync node — a simulated capture endpoint.
//!
//! ```text
//! capsync-node                   Connect to the hub in the config
//! capsync-node --config <path>   Load a custom config TOML
//! capsync-node --id <id>         Override the node id
//! capsync-node --server <host>   Override the hub address
//! capsync-node --gen-config      Write default config to stdout
//! ```

mod config;
mod device;

use std::path::PathBuf;

use capsync_core::{
    CommandMessage, CommandType, CoordinatorEvent, DeviceCoordinator, MarkerEvent, Message,
};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use config::NodeConfig;
use device::SimulatedDevice;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "capsync-node", about = "capsync simulated capture node")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "capsync-node.toml")]
    config: PathBuf,

    /// Override the node id.
    #[arg(long)]
    id: Option<String>,

    /// Override the hub host.
    #[arg(long)]
    server: Option<String>,

    /// Override the hub port.
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
        let text = toml::to_string_pretty(&NodeConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = NodeConfig::load(&cli.config);
    if let Some(id) = cli.id {
        config.coordinator.local_id = id;
    }
    if let Some(server) = cli.server {
        config.coordinator.network.server_address = server;
    }
    if let Some(port) = cli.port {
        config.coordinator.network.port = port;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("capsync-node v{}", env!("CARGO_PKG_VERSION"));
    info!("node id: {}", config.coordinator.local_id);
    info!("hub: {}", config.coordinator.network.server_socket());
    info!("streams: {}", config.device.streams.join(", "));

    let mut device = SimulatedDevice::new(&config.device);
    let (node, mut events) = DeviceCoordinator::client(config.coordinator)?;
    node.start().await?;

    let mut markers: Vec<MarkerEvent> = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(CoordinatorEvent::MessageReceived {
                    endpoint_id,
                    message: Message::Command(command),
                }) => {
                    handle_command(&node, &mut device, &mut markers, &endpoint_id, &command).await;
                }
                Some(event) => log_event(&event),
                None => break,
            },
        }
    }

    node.stop().await;
    info!(markers = markers.len(), "sync markers received this run");
    Ok(())
}

async fn handle_command(
    node: &DeviceCoordinator,
    device: &mut SimulatedDevice,
    markers: &mut Vec<MarkerEvent>,
    hub_id: &str,
    command: &CommandMessage,
) {
    if command.kind == CommandType::SyncMarker {
        match node.record_marker(hub_id, command) {
            Ok(marker) => {
                info!(
                    marker = %marker.marker_id,
                    kind = %marker.marker_type,
                    local = marker.local_timestamp,
                    hub_time = ?marker.coordinator_timestamp,
                    "sync marker"
                );
                markers.push(marker);
            }
            Err(e) => warn!(error = %e, "bad sync marker"),
        }
        return;
    }

    let Some(reply) = device.handle(command) else {
        debug!(kind = %command.kind, "command ignored");
        return;
    };
    info!(
        command = %command.kind,
        status = %reply.status,
        message = %reply.message,
        "answering hub"
    );
    if let Err(e) = node
        .send_response(hub_id, reply.kind, reply.status, &reply.message, reply.data)
        .await
    {
        warn!(error = %e, "reply not sent");
    }
}

fn log_event(event: &CoordinatorEvent) {
    match event {
        CoordinatorEvent::DeviceConnected { endpoint_id } => {
            info!(hub = %endpoint_id, "connected to hub");
        }
        CoordinatorEvent::DeviceDisconnected { endpoint_id, reason } => {
            warn!(hub = %endpoint_id, %reason, "disconnected from hub");
        }
        CoordinatorEvent::SyncCompleted {
            endpoint_id,
            offset_millis,
            round_trip_millis,
        } => {
            info!(
                hub = %endpoint_id,
                offset_ms = offset_millis,
                rtt_ms = round_trip_millis,
                "clock synced"
            );
        }
        CoordinatorEvent::ConnectionLost { endpoint_id } => {
            warn!(hub = %endpoint_id, "hub silent, connection lost");
        }
        CoordinatorEvent::ConnectionRecovered { endpoint_id } => {
            info!(hub = %endpoint_id, "hub heard again");
        }
        CoordinatorEvent::ConnectionPermanentlyLost { endpoint_id } => {
            warn!(hub = %endpoint_id, "hub permanently lost, reconnecting");
        }
        CoordinatorEvent::Error {
            endpoint_id,
            description,
        } => {
            warn!(hub = %endpoint_id, error = %description, "transport error");
        }
        CoordinatorEvent::MessageReceived {
            endpoint_id,
            message,
        } => {
            debug!(hub = %endpoint_id, kind = %message.kind(), "message");
        }
    }
}
