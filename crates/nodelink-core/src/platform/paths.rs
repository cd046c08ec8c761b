//! Platform-specific default paths for the node and its IPC endpoint.

use crate::config::NodeDefaults;
use std::path::{Path, PathBuf};

/// Default node data directory.
///
/// # Platform Behavior
/// - **Linux**: `~/.dubaicoin`
/// - **macOS**: `~/Library/Dubaicoin`
/// - **Windows**: `%APPDATA%\Dubaicoin`
///
/// Falls back to a relative directory when the home directory is unknown.
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        dirs::data_dir()
            .map(|dir| dir.join(NodeDefaults::DATA_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(NodeDefaults::DATA_DIR_NAME))
    }

    #[cfg(target_os = "macos")]
    {
        dirs::home_dir()
            .map(|home| home.join("Library").join(NodeDefaults::DATA_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(NodeDefaults::DATA_DIR_NAME))
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let hidden = format!(".{}", NodeDefaults::DATA_DIR_NAME.to_lowercase());
        dirs::home_dir()
            .map(|home| home.join(&hidden))
            .unwrap_or_else(|| PathBuf::from(hidden))
    }
}

/// IPC endpoint the node listens on for the given data directory.
///
/// # Platform Behavior
/// - **Linux/macOS**: `{data_dir}/gdbix.ipc`, or `{data_dir}/testnet/gdbix.ipc`
///   when the test network is selected
/// - **Windows**: the named pipe `\\.\pipe\gdbix.ipc` (shared by both networks)
pub fn default_ipc_path(data_dir: &Path, testnet: bool) -> PathBuf {
    #[cfg(windows)]
    {
        let _ = (data_dir, testnet);
        PathBuf::from(format!(r"\\.\pipe\{}", NodeDefaults::IPC_FILE_NAME))
    }

    #[cfg(not(windows))]
    {
        if testnet {
            data_dir
                .join(NodeDefaults::TESTNET_DIR_NAME)
                .join(NodeDefaults::IPC_FILE_NAME)
        } else {
            data_dir.join(NodeDefaults::IPC_FILE_NAME)
        }
    }
}

/// Locate the node binary.
///
/// Looks next to the running executable first, then on `PATH`. When neither
/// has it, the bare binary name is returned so the error surfaced at launch
/// names what was expected.
pub fn default_node_path() -> PathBuf {
    let name = binary_file_name();

    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let candidate = dir.join(&name);
        if candidate.is_file() {
            return candidate;
        }
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(&name);
            if candidate.is_file() {
                return candidate;
            }
        }
    }

    PathBuf::from(name)
}

fn binary_file_name() -> String {
    #[cfg(windows)]
    {
        format!("{}.exe", NodeDefaults::BINARY_NAME)
    }
    #[cfg(not(windows))]
    {
        NodeDefaults::BINARY_NAME.to_string()
    }
}
