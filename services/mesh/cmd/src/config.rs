//! Configuration handling for the messenger node.
//!
//! Values come from built-in defaults, then an optional YAML file, then
//! `MESH_*` environment variables; command line flags are applied last by
//! `main`.

use anyhow::Result;
use clap::ValueEnum;
use mesh_session::RegistryConfig;
use mesh_storage::StorageMode;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default listening port
pub const DEFAULT_PORT: u16 = 5555;

/// Where the message log lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Kept in memory, lost on exit
    Memory,
    /// `sent.log` / `received.log` in the data directory
    #[default]
    File,
}

/// Messenger node configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MessengerConfig {
    /// Port the listener binds
    pub port: u16,
    /// Advertise this IP instead of probing
    pub advertise_ip: Option<IpAddr>,
    /// Host used by the address probe
    pub probe_addr: SocketAddr,
    /// Address probe timeout
    pub probe_timeout: Duration,
    /// Time allowed for goodbye notices to flush on exit
    pub shutdown_grace: Duration,
    /// Message log backend
    pub storage: StorageKind,
    /// Directory for the file backend
    pub data_dir: PathBuf,
    /// Peers dialed at startup
    pub bootstrap_peers: Vec<String>,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        let registry = RegistryConfig::default();
        Self {
            port: DEFAULT_PORT,
            advertise_ip: None,
            probe_addr: registry.probe_addr,
            probe_timeout: registry.probe_timeout,
            shutdown_grace: registry.shutdown_grace,
            storage: StorageKind::File,
            data_dir: PathBuf::from("./logs"),
            bootstrap_peers: Vec::new(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    node: Option<NodeSection>,
    storage: Option<StorageSection>,
    peers: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct NodeSection {
    port: Option<u16>,
    advertise_ip: Option<IpAddr>,
    probe_addr: Option<SocketAddr>,
    probe_timeout: Option<String>,
    shutdown_grace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorageSection {
    mode: Option<StorageKind>,
    data_dir: Option<PathBuf>,
}

impl MessengerConfig {
    /// Load configuration from an optional file plus environment variables
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path {
            config.apply_file(path);
        }

        config.apply_environment_overrides();

        info!(
            "Messenger configuration: port={}, storage={:?}, data_dir={:?}, advertise_ip={:?}",
            config.port, config.storage, config.data_dir, config.advertise_ip
        );
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                return;
            }
        };

        match serde_yaml::from_str::<RootConfig>(&content) {
            Ok(root) => {
                self.apply_root_config(root);
                info!("Loaded configuration from {:?}", path);
            }
            Err(e) => warn!("Failed to parse config file {:?}: {}, using defaults", path, e),
        }
    }

    fn apply_root_config(&mut self, root: RootConfig) {
        if let Some(node) = root.node {
            if let Some(port) = node.port {
                self.port = port;
            }
            if node.advertise_ip.is_some() {
                self.advertise_ip = node.advertise_ip;
            }
            if let Some(probe_addr) = node.probe_addr {
                self.probe_addr = probe_addr;
            }
            if let Some(timeout) = node.probe_timeout.as_deref().and_then(parse_duration) {
                self.probe_timeout = timeout;
            }
            if let Some(grace) = node.shutdown_grace.as_deref().and_then(parse_duration) {
                self.shutdown_grace = grace;
            }
        }

        if let Some(storage) = root.storage {
            if let Some(mode) = storage.mode {
                self.storage = mode;
            }
            if let Some(data_dir) = storage.data_dir {
                self.data_dir = data_dir;
            }
        }

        if let Some(peers) = root.peers {
            self.bootstrap_peers = peers;
        }
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("MESH_PORT") {
            match value.parse::<u16>() {
                Ok(port) => {
                    self.port = port;
                    info!("Port overridden by environment: {}", port);
                }
                Err(_) => warn!("Ignoring invalid MESH_PORT {:?}", value),
            }
        }

        if let Some(value) = lookup("MESH_DATA_DIR") {
            self.data_dir = PathBuf::from(value);
            info!("Data directory overridden by environment: {:?}", self.data_dir);
        }

        if let Some(value) = lookup("MESH_STORAGE_MODE") {
            match StorageKind::from_str(&value, true) {
                Ok(mode) => {
                    self.storage = mode;
                    info!("Storage mode overridden by environment: {:?}", mode);
                }
                Err(_) => warn!("Ignoring invalid MESH_STORAGE_MODE {:?}", value),
            }
        }

        if let Some(value) = lookup("MESH_ADVERTISE_IP") {
            match value.parse::<IpAddr>() {
                Ok(ip) => {
                    self.advertise_ip = Some(ip);
                    info!("Advertised IP overridden by environment: {}", ip);
                }
                Err(_) => warn!("Ignoring invalid MESH_ADVERTISE_IP {:?}", value),
            }
        }
    }

    /// Settings for the connection registry
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            advertise_ip: self.advertise_ip,
            probe_addr: self.probe_addr,
            probe_timeout: self.probe_timeout,
            shutdown_grace: self.shutdown_grace,
            ..RegistryConfig::default()
        }
    }

    /// Backend selection for the message log
    pub fn storage_mode(&self) -> StorageMode {
        match self.storage {
            StorageKind::Memory => StorageMode::InMemory,
            StorageKind::File => StorageMode::File {
                data_dir: self.data_dir.clone(),
            },
        }
    }
}

fn parse_duration(value: &str) -> Option<Duration> {
    match humantime::parse_duration(value) {
        Ok(duration) => Some(duration),
        Err(e) => {
            warn!("Ignoring invalid duration {:?}: {}", value, e);
            None
        }
    }
}
