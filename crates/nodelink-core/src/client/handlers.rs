//! Interpretation of successful replies, one handler per request kind.
//!
//! Handlers run while their request is still the active one, so anything
//! they submit is queued behind it. Returning an error hands the request to
//! the failure policy instead of completing it normally.

use super::core::ClientCore;
use super::events::NodeEvent;
use super::filters::FilterKind;
use super::state::ClientState;
use crate::error::{NodeError, Result};
use crate::rpc::{Request, RequestKind};
use crate::types::{AccountInfo, SyncStatus, TransactionInfo};
use crate::units;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static NODE_VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+/v(\d+)\.(\d+)\.(\d+)").expect("node version regex must compile")
});

/// Version number embedded in a `web3_clientVersion` string such as
/// `Gdbix/v1.5.2-stable-a1b2c3/linux/go1.9`.
pub fn parse_node_version(client_version: &str) -> Option<semver::Version> {
    let captures = NODE_VERSION_RE.captures(client_version)?;
    let part = |i: usize| captures.get(i).and_then(|m| m.as_str().parse::<u64>().ok());
    Some(semver::Version::new(part(1)?, part(2)?, part(3)?))
}

fn expect_str<'a>(result: &'a Value, method: &str) -> Result<&'a str> {
    result
        .as_str()
        .ok_or_else(|| NodeError::validation(method, format!("expected a string, got {}", result)))
}

fn expect_bool(result: &Value, method: &str) -> Result<bool> {
    result
        .as_bool()
        .ok_or_else(|| NodeError::validation(method, format!("expected a boolean, got {}", result)))
}

fn expect_array<'a>(result: &'a Value, method: &str) -> Result<&'a Vec<Value>> {
    result
        .as_array()
        .ok_or_else(|| NodeError::validation(method, format!("expected a list, got {}", result)))
}

fn sync_status(result: &Value) -> Result<SyncStatus> {
    match result {
        Value::Bool(false) => Ok(SyncStatus::default()),
        Value::Bool(true) => Ok(SyncStatus {
            syncing: true,
            ..SyncStatus::default()
        }),
        Value::Object(progress) => {
            let block = |name: &str| match progress.get(name) {
                Some(value) => units::quantity_u64(value),
                None => Ok(0),
            };
            Ok(SyncStatus {
                syncing: true,
                current_block: block("currentBlock")?,
                highest_block: block("highestBlock")?,
                starting_block: block("startingBlock")?,
            })
        }
        other => Err(NodeError::validation(
            "eth_syncing",
            format!("unexpected sync status {}", other),
        )),
    }
}

impl ClientCore {
    pub(super) fn handle_reply(&mut self, request: &Request, result: Value) -> Result<()> {
        let method = request.method();
        match request.kind() {
            RequestKind::GetAccounts => {
                let hashes = expect_array(&result, method)?;
                self.accounts = hashes
                    .iter()
                    .filter_map(Value::as_str)
                    .map(AccountInfo::new)
                    .collect();
                debug!("Listed {} accounts", self.accounts.len());
                self.emit(NodeEvent::AccountsListed(self.accounts.clone()));
            }
            RequestKind::GetBalance => {
                let balance = units::wei_to_ether(units::quantity(&result)?);
                self.update_account(request, |account| account.balance = Some(balance));
            }
            RequestKind::GetTransactionCount => {
                let count = units::quantity_u64(&result)?;
                self.update_account(request, |account| account.transaction_count = Some(count));
            }
            RequestKind::NewAccount => {
                let hash = expect_str(&result, method)?.to_string();
                let index = request.target_index().unwrap_or(self.accounts.len());
                if index == self.accounts.len() {
                    self.accounts.push(AccountInfo::new(hash.clone()));
                }
                info!("Created account {}", hash);
                self.emit(NodeEvent::AccountCreated { hash, index });
            }
            RequestKind::DeleteAccount => {
                let ok = expect_bool(&result, method)?;
                let index = request.target_index().unwrap_or(usize::MAX);
                if ok && self.account_matches(index, request.first_param_str()) {
                    self.accounts.remove(index);
                }
                self.emit(NodeEvent::AccountDeleted { ok, index });
            }
            RequestKind::UnlockAccount => {
                let ok = expect_bool(&result, method)?;
                let index = request.target_index().unwrap_or(usize::MAX);
                self.emit(NodeEvent::AccountUnlocked { ok, index });
                if !ok {
                    warn!("Unlock account failure");
                    self.emit(NodeEvent::ErrorRaised {
                        message: "Unlock account failure".to_string(),
                        code: 0,
                    });
                }
            }
            RequestKind::SendTransaction => {
                let hash = expect_str(&result, method)?.to_string();
                info!("Transaction sent: {}", hash);
                self.emit(NodeEvent::TransactionSent(hash));
            }
            RequestKind::GetBlockNumber => {
                self.block_number = units::quantity_u64(&result)?;
                self.emit(NodeEvent::BlockNumberChanged(self.block_number));
            }
            RequestKind::GetPeerCount => {
                self.peer_count = units::quantity_u64(&result)?;
                self.emit(NodeEvent::PeerCountChanged(self.peer_count));
            }
            RequestKind::GetGasPrice => {
                let price = units::wei_to_ether(units::quantity(&result)?);
                self.emit(NodeEvent::GasPrice(price));
            }
            RequestKind::EstimateGas => {
                let gas = units::quantity(&result)?;
                self.emit(NodeEvent::GasEstimate(gas.to_string()));
            }
            RequestKind::NewBlockFilter => {
                let id = expect_str(&result, method)?;
                self.filters.install_succeeded(FilterKind::Block, id)?;
            }
            RequestKind::NewEventFilter => {
                let id = expect_str(&result, method)?;
                self.filters.install_succeeded(FilterKind::Event, id)?;
            }
            RequestKind::UninstallFilter => {
                let ok = expect_bool(&result, method)?;
                if let Some(id) = request.first_param_str() {
                    if !ok {
                        warn!("Node did not know filter {}", id);
                    }
                    self.filters.uninstall_finished(id);
                }
                self.after_uninstall();
            }
            RequestKind::GetFilterChanges => {
                for change in expect_array(&result, method)? {
                    match change {
                        Value::String(hash) => self.get_block_by_hash(hash),
                        Value::Object(_) => self.emit(NodeEvent::NewLogEvent {
                            log: change.clone(),
                            is_new: true,
                        }),
                        other => debug!("Ignoring filter change {}", other),
                    }
                }
            }
            RequestKind::GetLogs => {
                for log in expect_array(&result, method)? {
                    self.emit(NodeEvent::NewLogEvent {
                        log: log.clone(),
                        is_new: false,
                    });
                }
            }
            RequestKind::GetTransactionByHash => {
                let hash = request.first_param_str().unwrap_or_default().to_string();
                let transaction = (!result.is_null()).then(|| TransactionInfo::from_value(&result));
                self.emit(NodeEvent::NewTransaction { hash, transaction });
            }
            RequestKind::GetBlock => {
                if !result.is_object() {
                    return Err(NodeError::validation(method, format!("expected a block, got {}", result)));
                }
                if let Some(number) = result.get("number").filter(|n| !n.is_null()) {
                    self.block_number = units::quantity_u64(number)?;
                    self.emit(NodeEvent::BlockNumberChanged(self.block_number));
                }
                self.emit(NodeEvent::NewBlock(result));
            }
            RequestKind::GetTransactionReceipt => {
                self.emit(NodeEvent::TransactionReceipt(result));
            }
            RequestKind::GetClientVersion => {
                let version = expect_str(&result, method)?.to_string();
                info!("Node version: {}", version);
                self.client_version = Some(version.clone());
                self.emit(NodeEvent::ClientVersionChanged(version.clone()));
                self.check_node_version(&version);
            }
            RequestKind::GetNetVersion => {
                let network = match &result {
                    Value::String(text) => text.trim().parse::<u64>().ok(),
                    Value::Number(n) => n.as_u64(),
                    _ => None,
                }
                .ok_or_else(|| {
                    NodeError::validation(method, format!("unexpected network version {}", result))
                })?;
                info!("Node network: {}", network);
                self.network_version = Some(network);
                self.emit(NodeEvent::NetworkVersionChanged(network));
                if self.state == ClientState::Connected && self.poll_schedule().is_none() {
                    self.ipc_ready();
                }
            }
            RequestKind::GetSyncing => {
                let status = sync_status(&result)?;
                self.on_sync_status(status);
            }
        }
        Ok(())
    }

    fn account_matches(&self, index: usize, hash: Option<&str>) -> bool {
        match (self.accounts.get(index), hash) {
            (Some(account), Some(hash)) => account.hash.eq_ignore_ascii_case(hash),
            _ => false,
        }
    }

    fn update_account(&mut self, request: &Request, update: impl FnOnce(&mut AccountInfo)) {
        let Some(index) = request.target_index() else {
            return;
        };
        if !self.account_matches(index, request.first_param_str()) {
            debug!("Dropping {} reply for unknown account slot {}", request.method(), index);
            return;
        }
        let account = &mut self.accounts[index];
        update(account);
        let account = account.clone();
        self.emit(NodeEvent::AccountUpdated { index, account });
    }

    fn check_node_version(&self, client_version: &str) {
        let (Some(minimum), Some(found)) = (&self.min_version, parse_node_version(client_version)) else {
            return;
        };
        if found < *minimum {
            self.refuse(NodeError::validation(
                "node version",
                format!(
                    "Node version {} is older than the supported minimum {}. Please update the node.",
                    found, minimum
                ),
            ));
        }
    }

    fn on_sync_status(&mut self, status: SyncStatus) {
        let changed = status != self.sync;
        self.sync = status;
        if changed {
            self.emit(NodeEvent::SyncingChanged(status));
        }
        if !self.state.is_session() {
            return;
        }

        if status.syncing {
            if self.state != ClientState::Syncing {
                info!(
                    "Node is syncing: block {} of {}",
                    status.current_block, status.highest_block
                );
                self.set_state(ClientState::Syncing);
                self.filters.cancel_block_reinstall();
                if let Some(id) = self.filters.begin_uninstall(FilterKind::Block) {
                    self.send_uninstall(id);
                }
            }
        } else if self.state != ClientState::Synced {
            info!("Node is synced");
            self.set_state(ClientState::Synced);
            if self.filters.is_uninstalling(FilterKind::Block) {
                self.filters.request_block_reinstall();
            } else if !self.filters.is_tracked(FilterKind::Block) {
                self.new_block_filter();
            }
        }
    }
}
