//! Peer-to-peer messenger node.
//!
//! Starts a TCP listener, dials any bootstrap peers and runs the interactive
//! menu on the terminal. Socket work happens on the registry's event loop
//! thread; received messages are printed by a separate printer thread.

use anyhow::Context;
use clap::Parser;
use mesh_session::{ConnectionRegistry, RegistryEvent, RegistryEvents};
use std::net::IpAddr;
use std::path::PathBuf;
use std::thread;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
#[macro_use]
mod logging;
mod ui;

use config::{MessengerConfig, StorageKind};
use logging::MeshLogFormatter;
use ui::{parse_peer_address, Menu};

/// Peer-to-peer messenger node
#[derive(Parser, Debug)]
#[command(name = "p2p-mesh", version, about = "Peer-to-peer TCP messenger node")]
struct Args {
    /// Listening port (default 5555)
    port: Option<u16>,

    /// Configuration file path (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Message log backend
    #[arg(long, value_enum)]
    storage_mode: Option<StorageKind>,

    /// Directory holding sent.log and received.log
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// IP to advertise instead of probing for one
    #[arg(long)]
    advertise_ip: Option<IpAddr>,

    /// Peer to dial at startup, e.g. 10.0.0.5:5555 (repeatable)
    #[arg(long)]
    connect: Vec<String>,

    /// Time allowed for goodbye notices to flush on exit, e.g. 500ms
    #[arg(long)]
    shutdown_grace: Option<humantime::Duration>,
}

impl Args {
    fn apply_to(&self, config: &mut MessengerConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(mode) = self.storage_mode {
            config.storage = mode;
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if self.advertise_ip.is_some() {
            config.advertise_ip = self.advertise_ip;
        }
        if let Some(grace) = self.shutdown_grace {
            config.shutdown_grace = grace.into();
        }
        config.bootstrap_peers.extend(self.connect.iter().cloned());
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("p2p_mesh={}", args.log_level).parse()?)
        .add_directive(format!("mesh_session={}", args.log_level).parse()?)
        .add_directive(format!("mesh_storage={}", args.log_level).parse()?)
        .add_directive(format!("mesh_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(MeshLogFormatter::new("p2p-mesh"))
        .init();

    info!("Starting p2p-mesh v{}", env!("CARGO_PKG_VERSION"));

    let mut config = MessengerConfig::load(args.config.as_deref())?;
    args.apply_to(&mut config);

    let log = mesh_storage::open_log(config.storage_mode()).context("opening message log")?;
    let (registry, events) = ConnectionRegistry::new(config.registry_config(), log.clone())
        .context("starting connection registry")?;

    registry.register_disconnect_observer(|peer| println!("\nPeer disconnected: {}", peer));

    if let Err(e) = registry.start_listening(config.port) {
        component_error!(
            "net",
            "Failed to listen on port {}: {}; inbound connections disabled",
            config.port,
            e
        );
    }

    for peer in &config.bootstrap_peers {
        match parse_peer_address(peer) {
            Ok(address) => registry.connect(&address)?,
            Err(e) => component_warn!("net", "Skipping bootstrap peer {:?}: {:#}", peer, e),
        }
    }

    spawn_event_printer(events).context("starting event printer")?;

    let result = Menu::new(registry.clone(), log, std::io::stdin().lock(), std::io::stdout()).run();

    registry.shutdown();
    component_info!("net", "Node stopped");
    result
}

/// Print received messages and failed dials as they happen. Ends when the
/// registry is dropped.
fn spawn_event_printer(mut events: RegistryEvents) -> std::io::Result<()> {
    thread::Builder::new()
        .name("mesh-printer".to_string())
        .spawn(move || {
            while let Some(event) = events.blocking_recv() {
                match event {
                    RegistryEvent::MessageReceived { message } => println!(
                        "\nNew message from {} | Topic: {} | Content: {}",
                        message.peer_id, message.topic, message.content
                    ),
                    RegistryEvent::ConnectFailed { address, reason } => {
                        println!("\nCould not connect to {}: {}", address, reason)
                    }
                    _ => {}
                }
            }
        })?;
    Ok(())
}
