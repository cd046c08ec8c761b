//! Connection state machine.

use crate::config::NodeDefaults;
use crate::types::{AccountInfo, SyncStatus};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    NotStarted,
    /// Connecting to a node that may already be running, without spawning.
    TryExistingFirst,
    Spawning,
    Connecting,
    /// Socket up; handshake in progress or sync state not yet known.
    Connected,
    Synced,
    Syncing,
    Closing,
    Terminated,
    Error,
}

impl ClientState {
    /// Allowed transitions. Staying in the same state is always allowed.
    pub fn can_transition_to(self, next: ClientState) -> bool {
        use ClientState::*;

        if self == next {
            return true;
        }
        match self {
            NotStarted => matches!(next, TryExistingFirst | Spawning | Closing | Error),
            TryExistingFirst => matches!(next, Spawning | Connected | Closing | Error),
            Spawning => matches!(next, Connecting | Closing | Error),
            Connecting => matches!(next, Connected | Closing | Error),
            Connected => matches!(next, Synced | Syncing | Closing | Error),
            Synced => matches!(next, Syncing | Closing | Error),
            Syncing => matches!(next, Synced | Closing | Error),
            Closing => matches!(next, Terminated),
            Error => matches!(next, TryExistingFirst | Closing),
            Terminated => false,
        }
    }

    /// True once the socket is up and until closing begins.
    pub fn is_session(self) -> bool {
        matches!(
            self,
            ClientState::Connected | ClientState::Synced | ClientState::Syncing
        )
    }

    /// Stage reported to collaborators for this state, given the last one.
    pub fn stage(self, previous: StartingStage) -> StartingStage {
        match self {
            ClientState::NotStarted => StartingStage::NotStarted,
            ClientState::TryExistingFirst => StartingStage::TryExistingFirst,
            ClientState::Spawning | ClientState::Connecting => StartingStage::Spawning,
            ClientState::Connected | ClientState::Synced | ClientState::Syncing => {
                StartingStage::Connected
            }
            ClientState::Error => StartingStage::Failed,
            ClientState::Closing | ClientState::Terminated => previous,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::NotStarted => "not started",
            ClientState::TryExistingFirst => "trying existing node",
            ClientState::Spawning => "spawning node",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Synced => "synced",
            ClientState::Syncing => "syncing",
            ClientState::Closing => "closing",
            ClientState::Terminated => "terminated",
            ClientState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Coarse startup progress for splash-screen style collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartingStage {
    NotStarted,
    TryExistingFirst,
    Spawning,
    Connected,
    Failed,
}

/// Read-only view of the client for collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ClientState,
    pub stage: StartingStage,
    pub sync: SyncStatus,
    pub peer_count: u64,
    pub block_number: u64,
    pub client_version: Option<String>,
    pub network_version: Option<u64>,
    pub block_filter_id: Option<String>,
    pub event_filter_id: Option<String>,
    pub busy: bool,
    pub queue_length: usize,
    pub external: bool,
    pub closing: bool,
    pub poll_interval: Duration,
    pub accounts: Vec<AccountInfo>,
}

impl ConnectionSnapshot {
    pub fn is_testnet(&self) -> bool {
        self.network_version == Some(NodeDefaults::TESTNET_NETWORK_ID)
    }
}
