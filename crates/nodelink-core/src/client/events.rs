//! Events emitted by the client to its collaborators.

use super::state::{ClientState, StartingStage};
use crate::types::{AccountInfo, SyncStatus, TransactionInfo};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// Handshake finished; polling has started.
    ConnectionEstablished,
    ConnectionStateChanged(ClientState),
    StartingStageChanged(StartingStage),
    /// True when the client attached to a node it did not spawn.
    ExternalNodeAttached(bool),

    AccountsListed(Vec<AccountInfo>),
    AccountCreated { hash: String, index: usize },
    AccountDeleted { ok: bool, index: usize },
    AccountUpdated { index: usize, account: AccountInfo },
    AccountUnlocked { ok: bool, index: usize },

    BlockNumberChanged(u64),
    PeerCountChanged(u64),
    BusyChanged(bool),
    SyncingChanged(SyncStatus),

    NewBlock(Value),
    /// A log from an event filter poll (`is_new`) or a `eth_getLogs` load.
    NewLogEvent { log: Value, is_new: bool },
    /// `transaction` is `None` while the node does not know the hash yet.
    NewTransaction {
        hash: String,
        transaction: Option<TransactionInfo>,
    },
    TransactionSent(String),
    TransactionReceipt(Value),

    /// Gas price in ether.
    GasPrice(String),
    /// Estimated gas as a decimal integer.
    GasEstimate(String),

    ClientVersionChanged(String),
    NetworkVersionChanged(u64),

    ErrorRaised { message: String, code: i64 },

    ClosingChanged(bool),
    PollIntervalChanged(Duration),
}

impl NodeEvent {
    /// Error event for `err`, keeping the node's code for RPC errors.
    pub fn error(err: &crate::error::NodeError) -> Self {
        NodeEvent::ErrorRaised {
            message: err.to_string(),
            code: err.code(),
        }
    }
}
