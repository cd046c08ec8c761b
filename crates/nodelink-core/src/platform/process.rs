//! Graceful stop signalling for the node process.

use crate::error::{NodeError, Result};
use tracing::debug;

/// Ask a process to shut down cleanly.
///
/// Returns `Ok(true)` when the request was delivered and `Ok(false)` when
/// the process no longer exists.
///
/// # Platform Behavior
/// - **Linux/macOS**: Sends `SIGTERM`
/// - **Other platforms**: No graceful mechanism; returns an error so the
///   caller falls back to a forced kill
pub fn request_graceful_stop(pid: u32) -> Result<bool> {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).map_err(|_| NodeError::Process {
            message: format!("Invalid process id {}", pid),
            path: None,
        })?;

        debug!("Sending SIGTERM to process {}", pid);
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(NodeError::Process {
                message: format!("Failed to send SIGTERM to {}: {}", pid, e),
                path: None,
            }),
        }
    }

    #[cfg(not(unix))]
    {
        debug!("No graceful stop available for process {}", pid);
        Err(NodeError::Process {
            message: "Graceful stop not supported on this platform".to_string(),
            path: None,
        })
    }
}
