//! Core configuration with defaults. Hosts override fields from their own config sources.

use std::path::PathBuf;
use std::time::Duration;

/// Display name the monitor advertises and the bridge looks for.
pub const DEFAULT_MONITOR_NAME: &str = "ResourcesBridgeMonitor";

/// Display name a bridge advertises when none is configured.
pub const DEFAULT_CLIENT_NAME: &str = "iPhone";

/// Client-side settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Display name of the monitor peer to address.
    pub monitor_name: String,
    /// Upper bound on waiting for an `Ack`.
    pub response_timeout: Duration,
    /// Upper bound on waiting for a transfer to finish.
    pub transfer_timeout: Duration,
    /// How often `wait_for_connection` restarts the session and re-checks.
    pub check_interval: Duration,
    /// How long `wait_for_connection` keeps trying.
    pub connect_duration: Duration,
    /// Root for staged outbound payloads.
    pub staging_dir: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            monitor_name: DEFAULT_MONITOR_NAME.to_string(),
            response_timeout: Duration::from_secs(10),
            transfer_timeout: Duration::from_secs(300),
            check_interval: Duration::from_secs(3),
            connect_duration: Duration::from_secs(20),
            staging_dir: crate::storage::default_root(),
        }
    }
}

/// Monitor-side settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// If set, request paths resolve under this directory and may not escape it.
    /// If unset, request paths are used as local paths verbatim.
    pub root: Option<PathBuf>,
    /// How long an acknowledged upload holds the slot against other peers.
    pub upload_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            root: None,
            upload_timeout: Duration::from_secs(300),
        }
    }
}
