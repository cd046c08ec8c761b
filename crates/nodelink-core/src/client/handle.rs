//! The client's event loop and the handle used to talk to it.
//!
//! One task owns the [`ClientCore`] and reacts to one thing at a time:
//! a command, a transport event, a process event, the connect timeout or a
//! poll tick. Nothing else touches the core, so requests can never race on
//! the socket.

use super::core::{ClientCore, CoreChannels};
use super::events::NodeEvent;
use super::state::ConnectionSnapshot;
use crate::config::{ClientConfig, ClientSettings};
use crate::error::{NodeError, Result};
use crate::process::{LogSink, NodeSupervisor, ProcessEvent};
use crate::transport::{LocalSocketTransport, Transport, TransportEvent};
use crate::types::TransactionRequest;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::debug;

#[derive(Debug)]
enum Command {
    Start,
    GetAccounts,
    NewAccount {
        password: String,
        index: usize,
    },
    DeleteAccount {
        hash: String,
        password: String,
        index: usize,
    },
    RefreshAccount {
        hash: String,
        index: usize,
    },
    GetBlockNumber,
    GetPeerCount,
    SendTransaction {
        transaction: TransactionRequest,
        password: String,
    },
    UnlockAccount {
        hash: String,
        password: String,
        duration_secs: u64,
        index: usize,
    },
    GetGasPrice,
    EstimateGas(TransactionRequest),
    GetTransactionByHash(String),
    GetBlockByHash(String),
    GetBlockByNumber(u64),
    GetTransactionReceipt(String),
    RegisterEventFilters {
        addresses: Vec<String>,
        topics: Vec<String>,
    },
    LoadLogs {
        addresses: Vec<String>,
        topics: Vec<String>,
        from_block: u64,
    },
    UninstallFilter(String),
    GetSyncing,
    GetClientVersion,
    GetNetVersion,
    SetPollInterval(u64),
    CloseApp(oneshot::Sender<bool>),
    Status(oneshot::Sender<ConnectionSnapshot>),
}

/// Handle to a running node client.
///
/// Commands are fire-and-forget; results arrive as [`NodeEvent`]s on the
/// receiver returned by [`NodeClient::spawn`]. Cloning the handle shares the
/// same client. The client stops once every handle is dropped.
#[derive(Debug, Clone)]
pub struct NodeClient {
    commands: mpsc::UnboundedSender<Command>,
}

impl NodeClient {
    /// Spawn the client's event loop on the current tokio runtime.
    pub fn spawn(
        settings: ClientSettings,
        transport: Box<dyn Transport>,
        log_sink: Arc<dyn LogSink>,
    ) -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        Self::spawn_with_supervisor(settings, transport, log_sink, NodeSupervisor::new())
    }

    pub fn spawn_with_supervisor(
        settings: ClientSettings,
        transport: Box<dyn Transport>,
        log_sink: Arc<dyn LogSink>,
        supervisor: NodeSupervisor,
    ) -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (process_tx, process_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let core = ClientCore::new(
            settings,
            transport,
            log_sink,
            CoreChannels {
                events: events_tx,
                transport: transport_tx,
                process: process_tx,
            },
        )
        .with_supervisor(supervisor);

        tokio::spawn(run(core, commands_rx, transport_rx, process_rx));
        (Self { commands: commands_tx }, events_rx)
    }

    /// Spawn a client for the node's local IPC endpoint from `settings`.
    pub fn connect_local(
        settings: ClientSettings,
        log_sink: Arc<dyn LogSink>,
    ) -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let transport = LocalSocketTransport::local(settings.ipc_path());
        Self::spawn(settings, Box::new(transport), log_sink)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| NodeError::ClientStopped)
    }

    /// Connect to a running node, or spawn one.
    pub fn start(&self) -> Result<()> {
        self.send(Command::Start)
    }

    pub fn get_accounts(&self) -> Result<()> {
        self.send(Command::GetAccounts)
    }

    /// Create an account; `index` is the slot it will occupy in the list.
    pub fn new_account(&self, password: impl Into<String>, index: usize) -> Result<()> {
        self.send(Command::NewAccount {
            password: password.into(),
            index,
        })
    }

    pub fn delete_account(
        &self,
        hash: impl Into<String>,
        password: impl Into<String>,
        index: usize,
    ) -> Result<()> {
        self.send(Command::DeleteAccount {
            hash: hash.into(),
            password: password.into(),
            index,
        })
    }

    /// Fetch balance and transaction count of an account.
    pub fn refresh_account(&self, hash: impl Into<String>, index: usize) -> Result<()> {
        self.send(Command::RefreshAccount {
            hash: hash.into(),
            index,
        })
    }

    pub fn get_block_number(&self) -> Result<()> {
        self.send(Command::GetBlockNumber)
    }

    pub fn get_peer_count(&self) -> Result<()> {
        self.send(Command::GetPeerCount)
    }

    pub fn send_transaction(
        &self,
        transaction: TransactionRequest,
        password: impl Into<String>,
    ) -> Result<()> {
        self.send(Command::SendTransaction {
            transaction,
            password: password.into(),
        })
    }

    pub fn unlock_account(
        &self,
        hash: impl Into<String>,
        password: impl Into<String>,
        duration_secs: u64,
        index: usize,
    ) -> Result<()> {
        self.send(Command::UnlockAccount {
            hash: hash.into(),
            password: password.into(),
            duration_secs,
            index,
        })
    }

    pub fn get_gas_price(&self) -> Result<()> {
        self.send(Command::GetGasPrice)
    }

    pub fn estimate_gas(&self, transaction: TransactionRequest) -> Result<()> {
        self.send(Command::EstimateGas(transaction))
    }

    pub fn get_transaction_by_hash(&self, hash: impl Into<String>) -> Result<()> {
        self.send(Command::GetTransactionByHash(hash.into()))
    }

    pub fn get_block_by_hash(&self, hash: impl Into<String>) -> Result<()> {
        self.send(Command::GetBlockByHash(hash.into()))
    }

    pub fn get_block_by_number(&self, number: u64) -> Result<()> {
        self.send(Command::GetBlockByNumber(number))
    }

    pub fn get_transaction_receipt(&self, hash: impl Into<String>) -> Result<()> {
        self.send(Command::GetTransactionReceipt(hash.into()))
    }

    /// Watch logs of `addresses`, replacing any previous event filter.
    pub fn register_event_filters(&self, addresses: Vec<String>, topics: Vec<String>) -> Result<()> {
        self.send(Command::RegisterEventFilters { addresses, topics })
    }

    pub fn load_logs(&self, addresses: Vec<String>, topics: Vec<String>, from_block: u64) -> Result<()> {
        self.send(Command::LoadLogs {
            addresses,
            topics,
            from_block,
        })
    }

    pub fn uninstall_filter(&self, id: impl Into<String>) -> Result<()> {
        self.send(Command::UninstallFilter(id.into()))
    }

    pub fn get_syncing(&self) -> Result<()> {
        self.send(Command::GetSyncing)
    }

    pub fn get_client_version(&self) -> Result<()> {
        self.send(Command::GetClientVersion)
    }

    pub fn get_net_version(&self) -> Result<()> {
        self.send(Command::GetNetVersion)
    }

    pub fn set_poll_interval(&self, interval_ms: u64) -> Result<()> {
        self.send(Command::SetPollInterval(interval_ms))
    }

    /// Advance the shutdown by one step; true once it is complete.
    pub async fn close_app(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::CloseApp(tx))?;
        rx.await.map_err(|_| NodeError::ClientStopped)
    }

    /// Run the shutdown to completion.
    pub async fn shutdown(&self) -> Result<()> {
        while !self.close_app().await? {
            tokio::time::sleep(ClientConfig::CLOSE_POLL_INTERVAL).await;
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<ConnectionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx))?;
        rx.await.map_err(|_| NodeError::ClientStopped)
    }
}

async fn run(
    mut core: ClientCore,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    mut process_events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    let mut poll: Option<(u64, Interval)> = None;

    loop {
        sync_poll_timer(&core, &mut poll);
        let deadline = core.connect_deadline();

        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => apply(&mut core, command),
                None => break,
            },
            Some(event) = transport_events.recv() => core.on_transport_event(event),
            Some(event) = process_events.recv() => core.on_process_event(event),
            _ = connect_timeout(deadline) => core.on_connect_timeout(),
            _ = poll_tick(&mut poll) => core.on_poll_tick(),
        }
    }
    debug!("Node client stopped");
}

fn apply(core: &mut ClientCore, command: Command) {
    match command {
        Command::Start => {
            if let Err(e) = core.init() {
                core.refuse(e);
            }
        }
        Command::GetAccounts => core.get_accounts(),
        Command::NewAccount { password, index } => core.new_account(&password, index),
        Command::DeleteAccount {
            hash,
            password,
            index,
        } => core.delete_account(&hash, &password, index),
        Command::RefreshAccount { hash, index } => core.refresh_account(&hash, index),
        Command::GetBlockNumber => core.get_block_number(),
        Command::GetPeerCount => core.get_peer_count(),
        Command::SendTransaction {
            transaction,
            password,
        } => core.send_transaction(&transaction, &password),
        Command::UnlockAccount {
            hash,
            password,
            duration_secs,
            index,
        } => core.unlock_account(&hash, &password, duration_secs, index),
        Command::GetGasPrice => core.get_gas_price(),
        Command::EstimateGas(transaction) => core.estimate_gas(&transaction),
        Command::GetTransactionByHash(hash) => core.get_transaction_by_hash(&hash),
        Command::GetBlockByHash(hash) => core.get_block_by_hash(&hash),
        Command::GetBlockByNumber(number) => core.get_block_by_number(number),
        Command::GetTransactionReceipt(hash) => core.get_transaction_receipt(&hash),
        Command::RegisterEventFilters { addresses, topics } => {
            core.register_event_filters(addresses, topics)
        }
        Command::LoadLogs {
            addresses,
            topics,
            from_block,
        } => core.load_logs(addresses, topics, from_block),
        Command::UninstallFilter(id) => core.uninstall_filter(&id),
        Command::GetSyncing => core.get_syncing(),
        Command::GetClientVersion => core.get_client_version(),
        Command::GetNetVersion => core.get_net_version(),
        Command::SetPollInterval(interval_ms) => core.set_poll_interval(interval_ms),
        Command::CloseApp(reply) => {
            let _ = reply.send(core.close_app());
        }
        Command::Status(reply) => {
            let _ = reply.send(core.snapshot());
        }
    }
}

/// Rebuild the poll timer when the core's schedule changed.
fn sync_poll_timer(core: &ClientCore, poll: &mut Option<(u64, Interval)>) {
    match core.poll_schedule() {
        Some((generation, period)) => {
            if poll.as_ref().map(|(current, _)| *current) != Some(generation) {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *poll = Some((generation, interval));
            }
        }
        None => *poll = None,
    }
}

async fn connect_timeout(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn poll_tick(poll: &mut Option<(u64, Interval)>) {
    match poll {
        Some((_, interval)) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
