//! Executable checks for the node binary.

use std::path::Path;

/// Check if a file exists and can be executed.
///
/// # Platform Behavior
/// - **Linux/macOS**: Checks that it is a regular file with any execute bit set
/// - **Windows**: Returns true for common executable extensions (.exe, .bat, .cmd)
pub fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(path) {
            Ok(metadata) => metadata.is_file() && metadata.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }

    #[cfg(windows)]
    {
        if !path.is_file() {
            return false;
        }
        path.extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                matches!(ext.as_str(), "exe" | "bat" | "cmd")
            })
            .unwrap_or(false)
    }

    #[cfg(not(any(unix, windows)))]
    {
        path.is_file()
    }
}
