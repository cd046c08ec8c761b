//! Centralized configuration for the node client.
//!
//! Fixed timing and sizing parameters live on unit structs as associated
//! constants. User-adjustable values live in [`ClientSettings`], which is
//! persisted as JSON.

use crate::error::{NodeError, Result};
use crate::platform;
use crate::process::NodeLaunchConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Connection, polling and shutdown timing.
pub struct ClientConfig;

impl ClientConfig {
    // Connecting
    pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);
    pub const MAX_CONNECT_ATTEMPTS: u32 = 20;

    // Shutdown
    pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(6);
    pub const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

    // Polling
    pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
    pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

    // Socket reads
    pub const READ_CHUNK_SIZE: usize = 8192;
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

    // Node output capture
    pub const NODE_LOG_CAPACITY: usize = 100;
}

/// Names used to locate the node and its files.
pub struct NodeDefaults;

impl NodeDefaults {
    pub const BINARY_NAME: &'static str = "gdbix";
    pub const DATA_DIR_NAME: &'static str = "Dubaicoin";
    pub const TESTNET_DIR_NAME: &'static str = "testnet";
    pub const IPC_FILE_NAME: &'static str = "gdbix.ipc";
    pub const TESTNET_NETWORK_ID: u64 = 4;
}

/// Persisted client settings.
///
/// Missing fields take their defaults when loading, so older settings files
/// keep working.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Path to the node binary.
    pub node_path: PathBuf,
    /// Extra command-line flags, whitespace separated.
    pub node_args: String,
    /// Node data directory, passed as `--datadir`.
    pub data_dir: PathBuf,
    /// Use the test network.
    pub testnet: bool,
    /// Explicit IPC endpoint; derived from `data_dir` when unset.
    pub ipc_path: Option<PathBuf>,
    /// Polling interval in whole seconds.
    pub poll_interval_secs: u64,
    /// Oldest node version accepted without a warning, e.g. `"1.5.1"`.
    pub min_node_version: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            node_path: platform::default_node_path(),
            node_args: String::new(),
            data_dir: platform::default_data_dir(),
            testnet: false,
            ipc_path: None,
            poll_interval_secs: ClientConfig::DEFAULT_POLL_INTERVAL_SECS,
            min_node_version: None,
        }
    }
}

impl ClientSettings {
    /// Load settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| NodeError::io_with_path(e, path))?;
        let settings: Self = serde_json::from_str(&content).map_err(|e| NodeError::Config {
            message: format!("Invalid settings file {}: {}", path.display(), e),
        })?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Load settings, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save settings as pretty-printed JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| NodeError::io_with_path(e, parent))?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| NodeError::io_with_path(e, path))?;
        debug!("Saved settings to {}", path.display());
        Ok(())
    }

    /// IPC endpoint to connect to.
    pub fn ipc_path(&self) -> PathBuf {
        self.ipc_path
            .clone()
            .unwrap_or_else(|| platform::default_ipc_path(&self.data_dir, self.testnet))
    }

    /// Polling interval, never below one second.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Store `interval`, rounding part seconds up.
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval_secs = interval.as_secs() + u64::from(interval.subsec_nanos() > 0);
    }

    /// Launch parameters for spawning the node.
    pub fn launch_config(&self) -> NodeLaunchConfig {
        NodeLaunchConfig::new(&self.node_path)
            .with_extra_args(self.node_args.split_whitespace().map(str::to_string).collect())
            .with_data_dir(&self.data_dir)
            .with_testnet(self.testnet)
    }

    /// Parsed minimum node version, if configured.
    pub fn min_version(&self) -> Result<Option<semver::Version>> {
        match self.min_node_version.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => semver::Version::parse(raw.trim_start_matches('v'))
                .map(Some)
                .map_err(|e| NodeError::validation("min_node_version", e.to_string())),
        }
    }
}
