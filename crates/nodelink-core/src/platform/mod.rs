//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior live here:
//! - `paths` - default data directory, IPC endpoint and node binary location
//! - `permissions` - executable checks for the node binary
//! - `process` - graceful stop signalling

pub mod paths;
pub mod permissions;
pub mod process;

pub use paths::{default_data_dir, default_ipc_path, default_node_path};
pub use permissions::is_executable;
pub use process::request_graceful_stop;
