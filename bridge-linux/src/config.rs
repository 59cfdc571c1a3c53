//! Load config from file and environment.

use bridge_core::config::{DEFAULT_CLIENT_NAME, DEFAULT_MONITOR_NAME};
use bridge_core::{BridgeConfig, MonitorConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Host configuration. File: ~/.config/resources-bridge/config.toml or
/// /etc/resources-bridge/config.toml.
/// Env overrides: RESOURCES_BRIDGE_DISCOVERY_PORT, RESOURCES_BRIDGE_TRANSPORT_PORT,
/// RESOURCES_BRIDGE_NAME, RESOURCES_BRIDGE_MONITOR_NAME, RESOURCES_BRIDGE_ROOT,
/// RESOURCES_BRIDGE_INBOX.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Transport TCP port (default 45681; 0 picks a free port).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Display name this host advertises. Defaults per role.
    #[serde(default)]
    pub name: Option<String>,
    /// Display name of the monitor the client commands talk to.
    #[serde(default = "default_monitor_name")]
    pub monitor_name: String,
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_connect_duration_secs")]
    pub connect_duration_secs: u64,
    /// How long the monitor holds an acknowledged upload for its peer.
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
    /// Monitor root directory. Unset: request paths are local paths.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Where received resources land before they are handed over.
    #[serde(default = "default_inbox")]
    pub inbox: PathBuf,
}

fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_monitor_name() -> String {
    DEFAULT_MONITOR_NAME.to_string()
}
fn default_response_timeout_secs() -> u64 {
    10
}
fn default_transfer_timeout_secs() -> u64 {
    300
}
fn default_check_interval_secs() -> u64 {
    3
}
fn default_connect_duration_secs() -> u64 {
    20
}
fn default_upload_timeout_secs() -> u64 {
    300
}
fn default_inbox() -> PathBuf {
    std::env::temp_dir().join(format!("resources-bridge-inbox-{}", std::process::id()))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            name: None,
            monitor_name: default_monitor_name(),
            response_timeout_secs: default_response_timeout_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
            connect_duration_secs: default_connect_duration_secs(),
            upload_timeout_secs: default_upload_timeout_secs(),
            root: None,
            inbox: default_inbox(),
        }
    }
}

impl Config {
    /// Name advertised by the monitor daemon.
    pub fn monitor_display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.monitor_name.clone())
    }

    /// Name advertised by the client commands.
    pub fn client_display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string())
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            monitor_name: self.monitor_name.clone(),
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            transfer_timeout: Duration::from_secs(self.transfer_timeout_secs),
            check_interval: Duration::from_secs(self.check_interval_secs),
            connect_duration: Duration::from_secs(self.connect_duration_secs),
            ..BridgeConfig::default()
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            root: self.root.clone(),
            upload_timeout: Duration::from_secs(self.upload_timeout_secs),
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = var("RESOURCES_BRIDGE_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
            self.discovery_port = p;
        }
        if let Some(p) = var("RESOURCES_BRIDGE_TRANSPORT_PORT").and_then(|s| s.parse().ok()) {
            self.transport_port = p;
        }
        if let Some(name) = var("RESOURCES_BRIDGE_NAME") {
            self.name = Some(name);
        }
        if let Some(name) = var("RESOURCES_BRIDGE_MONITOR_NAME") {
            self.monitor_name = name;
        }
        if let Some(root) = var("RESOURCES_BRIDGE_ROOT") {
            self.root = Some(PathBuf::from(root));
        }
        if let Some(inbox) = var("RESOURCES_BRIDGE_INBOX") {
            self.inbox = PathBuf::from(inbox);
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/resources-bridge/config.toml"));
    }
    out.push(PathBuf::from("/etc/resources-bridge/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}
