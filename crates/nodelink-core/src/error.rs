//! Error types for the node client.
//!
//! The variants mirror the failure classes the client distinguishes at
//! runtime: transport faults, protocol violations, server-side RPC errors,
//! node process problems and connect timeouts. Whether a given error tears
//! down the session is decided by the client, not by the error itself.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the nodelink library.
#[derive(Debug, Error)]
pub enum NodeError {
    // Connection errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Unable to establish IPC connection to the node after {attempts} attempts. Fix the node path and try again.")]
    ConnectTimeout { attempts: u32 },

    // Server errors
    #[error("{message}")]
    Rpc { code: i64, message: String },

    #[error("Result object undefined in IPC response for request: {method}")]
    MissingResult { method: String },

    // Node process errors
    #[error("Process error: {message}")]
    Process {
        message: String,
        path: Option<PathBuf>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Node client is no longer running")]
    ClientStopped,
}

/// Result type alias for nodelink operations.
pub type Result<T> = std::result::Result<T, NodeError>;

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl NodeError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        NodeError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        NodeError::Transport {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        NodeError::Protocol {
            message: message.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        NodeError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Error code carried by `error-raised` events.
    ///
    /// Server errors keep the code the node reported; every locally
    /// detected error reports 0.
    pub fn code(&self) -> i64 {
        match self {
            NodeError::Rpc { code, .. } => *code,
            _ => 0,
        }
    }

    /// True for faults of the connection itself rather than of one request.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            NodeError::Transport { .. }
                | NodeError::Protocol { .. }
                | NodeError::ConnectTimeout { .. }
                | NodeError::Process { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NodeError::protocol("Call number mismatch 3 != 2");
        assert_eq!(err.to_string(), "Protocol error: Call number mismatch 3 != 2");

        let err = NodeError::Rpc {
            code: -32000,
            message: "insufficient funds".into(),
        };
        assert_eq!(err.to_string(), "insufficient funds");

        let err = NodeError::ConnectTimeout { attempts: 20 };
        assert!(err.to_string().contains("after 20 attempts"));
    }

    #[test]
    fn test_code_only_for_rpc_errors() {
        let rpc = NodeError::Rpc {
            code: -32601,
            message: "method not found".into(),
        };
        assert_eq!(rpc.code(), -32601);
        assert_eq!(NodeError::transport("Socket not writeable").code(), 0);
        assert_eq!(NodeError::ClientStopped.code(), 0);
    }

    #[test]
    fn test_connection_fault_classification() {
        assert!(NodeError::transport("closed").is_connection_fault());
        assert!(NodeError::protocol("bad json").is_connection_fault());
        assert!(NodeError::ConnectTimeout { attempts: 20 }.is_connection_fault());
        assert!(!NodeError::MissingResult {
            method: "eth_gasPrice".into()
        }
        .is_connection_fault());
        assert!(!NodeError::Rpc {
            code: 1,
            message: "x".into()
        }
        .is_connection_fault());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: NodeError = io_err.into();
        match err {
            NodeError::Io { path, source, .. } => {
                assert!(path.is_none());
                assert!(source.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_io_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = NodeError::io_with_path(io_err, "/tmp/settings.json");
        assert!(err.to_string().contains("settings.json"));
    }
}
