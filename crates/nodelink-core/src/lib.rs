//! Nodelink - JSON-RPC client for a blockchain node over a local IPC socket.
//!
//! The client attaches to a running node or spawns one, frames the node's
//! un-delimited JSON stream into replies, keeps exactly one request in
//! flight, and simulates subscriptions by polling block and event filters.
//! Results are delivered as [`NodeEvent`]s.
//!
//! # Example
//!
//! ```rust,ignore
//! use nodelink::{ClientSettings, NodeClient, NodeEvent, TracingLogSink};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> nodelink::Result<()> {
//!     let settings = ClientSettings::default();
//!     let (client, mut events) = NodeClient::connect_local(settings, Arc::new(TracingLogSink));
//!     client.start()?;
//!
//!     while let Some(event) = events.recv().await {
//!         if event == NodeEvent::ConnectionEstablished {
//!             client.get_accounts()?;
//!         }
//!         if let NodeEvent::AccountsListed(accounts) = event {
//!             println!("{} accounts", accounts.len());
//!             break;
//!         }
//!     }
//!
//!     client.shutdown().await
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod platform;
pub mod process;
pub mod rpc;
pub mod transport;
pub mod types;
pub mod units;

pub use client::{
    ClientCore, ClientState, ConnectionSnapshot, CoreChannels, EventFilterSpec, FilterKind,
    NodeClient, NodeEvent, StartingStage,
};
pub use config::{ClientConfig, ClientSettings, NodeDefaults};
pub use error::{NodeError, Result};
pub use process::{LogSink, NodeLaunchConfig, NodeLog, NodeSupervisor, Termination, TracingLogSink};
pub use rpc::{MessageFramer, RequestKind};
pub use transport::{LocalSocketTransport, SocketState, TcpTransport, Transport};
pub use types::{AccountInfo, SyncStatus, TransactionInfo, TransactionRequest};
