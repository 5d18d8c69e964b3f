//! Load config from file and environment.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use natter_core::{CoreConfig, PeerAddress};
use serde::Deserialize;

use crate::radio::LanSettings;
use crate::service::ServiceSettings;

/// Daemon configuration. File: ~/.config/natter/config.toml or /etc/natter/config.toml.
/// Env overrides: NATTER_DEVICE_ADDRESS, NATTER_DISPLAY_NAME, NATTER_DISCOVERY_PORT,
/// NATTER_LINK_PORT, NATTER_DATA_FILE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address advertised to peers. When unset, a random locally administered address is
    /// generated once and kept in `device_address` next to the history file.
    #[serde(default)]
    pub device_address: Option<String>,
    /// Name shown to peers (default: $HOSTNAME, else "natter").
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Discovery UDP port (default 45690).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Link TCP port (default 45691).
    #[serde(default = "default_link_port")]
    pub link_port: u16,
    /// Ceiling on one scan cycle.
    #[serde(default = "default_scan_duration_secs")]
    pub scan_duration_secs: u64,
    /// Peers not re-sighted for this long drop off the list at the end of a cycle.
    #[serde(default = "default_peer_retention_secs")]
    pub peer_retention_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// How long shutdown waits for writers before closing sockets forcibly.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
    /// Conversation history file (default ~/.local/share/natter/conversations.json).
    #[serde(default)]
    pub data_file: Option<PathBuf>,
    /// env_logger filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Peers reachable without discovery: address → host:port.
    #[serde(default)]
    pub static_peers: HashMap<String, SocketAddr>,
}

fn default_display_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "natter".to_string())
}
fn default_discovery_port() -> u16 {
    45690
}
fn default_link_port() -> u16 {
    45691
}
fn default_scan_duration_secs() -> u64 {
    12
}
fn default_peer_retention_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_write_timeout_secs() -> u64 {
    5
}
fn default_shutdown_grace_ms() -> u64 {
    2000
}
fn default_max_frame_len() -> u32 {
    natter_core::wire::DEFAULT_MAX_FRAME_LEN
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_address: None,
            display_name: default_display_name(),
            discovery_port: default_discovery_port(),
            link_port: default_link_port(),
            scan_duration_secs: default_scan_duration_secs(),
            peer_retention_secs: default_peer_retention_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_frame_len: default_max_frame_len(),
            data_file: None,
            log_level: default_log_level(),
            static_peers: HashMap::new(),
        }
    }
}

impl Config {
    /// The configured address, else the persisted one (created on first run).
    pub fn device_address(&self) -> anyhow::Result<PeerAddress> {
        if let Some(a) = self.device_address.as_deref().filter(|a| !a.trim().is_empty()) {
            return Ok(PeerAddress::new(a));
        }
        match self.identity_file() {
            Some(path) => load_or_create_address(&path),
            None => {
                log::warn!("No data directory; using a new device address for this run");
                Ok(PeerAddress::random_local())
            }
        }
    }

    /// Where a generated device address is kept: beside the history file.
    pub fn identity_file(&self) -> Option<PathBuf> {
        self.data_file().map(|f| f.with_file_name("device_address"))
    }

    pub fn data_file(&self) -> Option<PathBuf> {
        self.data_file.clone().or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .map(|h| h.join(".local/share/natter/conversations.json"))
        })
    }

    pub fn static_peers(&self) -> HashMap<PeerAddress, SocketAddr> {
        self.static_peers
            .iter()
            .map(|(a, s)| (PeerAddress::new(a), *s))
            .collect()
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            scan_duration: self.scan_duration(),
            connect_timeout: self.connect_timeout(),
            write_timeout: self.write_timeout(),
            shutdown_grace: self.shutdown_grace(),
            core: CoreConfig {
                peer_retention: chrono::Duration::seconds(
                    self.peer_retention_secs.min(u64::from(u32::MAX)) as i64,
                ),
                max_frame_len: self.max_frame_len,
            },
            data_file: self.data_file(),
        }
    }

    pub fn lan_settings(&self) -> LanSettings {
        LanSettings {
            discovery_port: self.discovery_port,
            link_port: self.link_port,
            static_peers: self.static_peers(),
        }
    }
}

/// Read the address stored at `path`, or generate one and store it there.
fn load_or_create_address(path: &Path) -> anyhow::Result<PeerAddress> {
    match std::fs::read_to_string(path) {
        Ok(s) => {
            let address = PeerAddress::new(s.trim());
            if address.is_empty() {
                anyhow::bail!("device address file {} is empty", path.display());
            }
            Ok(address)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let address = PeerAddress::random_local();
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, format!("{}\n", address))
                .with_context(|| format!("writing {}", tmp.display()))?;
            std::fs::rename(&tmp, path)
                .with_context(|| format!("writing {}", path.display()))?;
            log::info!("Generated device address {} ({})", address, path.display());
            Ok(address)
        }
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

/// Load config: explicit file if given (must parse), else first default file found, then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => parse_file(p)?,
        None => load_default_file().unwrap_or_default(),
    };
    apply_env(&mut c);
    Ok(c)
}

fn apply_env(c: &mut Config) {
    if let Ok(s) = std::env::var("NATTER_DEVICE_ADDRESS") {
        c.device_address = Some(s);
    }
    if let Ok(s) = std::env::var("NATTER_DISPLAY_NAME") {
        c.display_name = s;
    }
    if let Ok(s) = std::env::var("NATTER_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Ok(s) = std::env::var("NATTER_LINK_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.link_port = p;
        }
    }
    if let Some(s) = std::env::var_os("NATTER_DATA_FILE") {
        c.data_file = Some(PathBuf::from(s));
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/natter/config.toml"));
    }
    out.push(PathBuf::from("/etc/natter/config.toml"));
    out
}

fn load_default_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match parse_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            log::warn!("{:#}; using defaults", e);
            None
        }
    }
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str::<Config>(&s).with_context(|| format!("parsing config {}", path.display()))
}
