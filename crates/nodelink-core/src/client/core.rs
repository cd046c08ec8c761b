//! The client's state machine.
//!
//! [`ClientCore`] owns everything mutable: the transport, the dispatcher,
//! the filters, the node process and the cached node figures. It never
//! blocks and never spawns its own tasks; the event loop in
//! [`super::handle`] feeds it transport events, process events, timer
//! expiries and commands one at a time, and reads back when it wants the
//! next timer to fire.

use super::events::NodeEvent;
use super::filters::{EventFilterSpec, FilterKind, FilterManager};
use super::state::{ClientState, ConnectionSnapshot, StartingStage};
use crate::config::{ClientConfig, ClientSettings};
use crate::error::{NodeError, Result};
use crate::process::{LogSink, NodeSupervisor, ProcessEvent, Termination};
use crate::rpc::{read_reply, Dispatcher, FailurePolicy, MessageFramer, Request, RequestKind};
use crate::transport::{SocketState, Transport, TransportEvent, TransportEventKind, TransportEventSender};
use crate::types::{AccountInfo, SyncStatus, TransactionRequest};
use crate::units;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const ATTACHED_LOG_LINE: &str = "Attached to external node, see logs in terminal window.";

/// Channels the core reports through.
#[derive(Debug, Clone)]
pub struct CoreChannels {
    /// Events for collaborators.
    pub events: mpsc::UnboundedSender<NodeEvent>,
    /// Handed to the transport on every connect attempt.
    pub transport: TransportEventSender,
    /// Handed to the supervisor when spawning the node.
    pub process: mpsc::UnboundedSender<ProcessEvent>,
}

pub struct ClientCore {
    pub(super) settings: ClientSettings,
    pub(super) transport: Box<dyn Transport>,
    pub(super) channels: CoreChannels,
    pub(super) supervisor: NodeSupervisor,
    pub(super) log_sink: Arc<dyn LogSink>,
    pub(super) framer: MessageFramer,
    pub(super) dispatcher: Dispatcher,
    pub(super) filters: FilterManager,

    pub(super) state: ClientState,
    pub(super) stage: StartingStage,
    pub(super) external: bool,
    pub(super) closing: bool,
    close_filters_sent: bool,

    pub(super) sync: SyncStatus,
    pub(super) peer_count: u64,
    pub(super) block_number: u64,
    pub(super) client_version: Option<String>,
    pub(super) network_version: Option<u64>,
    pub(super) accounts: Vec<AccountInfo>,
    pub(super) min_version: Option<semver::Version>,

    connect_attempts: u32,
    connect_deadline: Option<Instant>,
    last_socket_error: Option<String>,

    polling: bool,
    poll_interval: Duration,
    poll_generation: u64,
    busy_reported: bool,
}

impl ClientCore {
    pub fn new(
        settings: ClientSettings,
        transport: Box<dyn Transport>,
        log_sink: Arc<dyn LogSink>,
        channels: CoreChannels,
    ) -> Self {
        let min_version = settings.min_version().unwrap_or_else(|e| {
            warn!("Ignoring minimum node version: {}", e);
            None
        });
        let poll_interval = settings.poll_interval();
        Self {
            settings,
            transport,
            channels,
            supervisor: NodeSupervisor::new(),
            log_sink,
            framer: MessageFramer::new(),
            dispatcher: Dispatcher::new(),
            filters: FilterManager::new(),
            state: ClientState::NotStarted,
            stage: StartingStage::NotStarted,
            external: false,
            closing: false,
            close_filters_sent: false,
            sync: SyncStatus::default(),
            peer_count: 0,
            block_number: 0,
            client_version: None,
            network_version: None,
            accounts: Vec::new(),
            min_version,
            connect_attempts: 0,
            connect_deadline: None,
            last_socket_error: None,
            polling: false,
            poll_interval,
            poll_generation: 0,
            busy_reported: false,
        }
    }

    /// Replace the process supervisor, e.g. to shorten the kill grace period.
    pub fn with_supervisor(mut self, supervisor: NodeSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn stage(&self) -> StartingStage {
        self.stage
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// When the current connect attempt times out.
    pub fn connect_deadline(&self) -> Option<Instant> {
        self.connect_deadline
    }

    /// Poll timer to run, tagged with a generation that changes whenever the
    /// timer must be rebuilt. `None` while polling is stopped.
    pub fn poll_schedule(&self) -> Option<(u64, Duration)> {
        self.polling
            .then_some((self.poll_generation, self.poll_interval))
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            stage: self.stage,
            sync: self.sync,
            peer_count: self.peer_count,
            block_number: self.block_number,
            client_version: self.client_version.clone(),
            network_version: self.network_version,
            block_filter_id: self.filters.tracked_id(FilterKind::Block).map(str::to_string),
            event_filter_id: self.filters.tracked_id(FilterKind::Event).map(str::to_string),
            busy: self.dispatcher.is_busy(),
            queue_length: self.dispatcher.queue_len(),
            external: self.external,
            closing: self.closing,
            poll_interval: self.poll_interval,
            accounts: self.accounts.clone(),
        }
    }

    pub(super) fn emit(&self, event: NodeEvent) {
        let _ = self.channels.events.send(event);
    }

    pub(super) fn set_state(&mut self, next: ClientState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!("Ignoring state change {} -> {}", self.state, next);
            return;
        }
        debug!("State {} -> {}", self.state, next);
        self.state = next;
        self.emit(NodeEvent::ConnectionStateChanged(next));

        let stage = next.stage(self.stage);
        if stage != self.stage {
            self.stage = stage;
            self.emit(NodeEvent::StartingStageChanged(stage));
        }
    }

    fn report_busy(&mut self) {
        let busy = self.dispatcher.is_busy();
        if busy != self.busy_reported {
            self.busy_reported = busy;
            self.emit(NodeEvent::BusyChanged(busy));
        }
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Start the client: try a running node first, spawn one if none answers.
    ///
    /// Allowed before the first start and after a failure.
    pub fn init(&mut self) -> Result<()> {
        match self.state {
            ClientState::NotStarted => {}
            ClientState::Error => {
                debug!("Restarting after failure");
                self.transport.abort();
                self.dispatcher.reset();
                self.framer.clear();
                self.filters.clear();
            }
            other => {
                return Err(NodeError::validation(
                    "state",
                    format!("cannot start the client while {}", other),
                ));
            }
        }

        info!("Starting node client for {}", self.transport.describe());
        self.connect_attempts = 0;
        self.external = false;
        self.last_socket_error = None;
        self.set_state(ClientState::TryExistingFirst);
        self.connect_to_server();
        Ok(())
    }

    fn connect_to_server(&mut self) {
        self.dispatcher.reserve();
        self.report_busy();

        if self.transport.state() != SocketState::Unconnected {
            self.fail_hard(NodeError::transport("Already connected"));
            return;
        }
        if let Err(e) = self.transport.connect(self.channels.transport.clone()) {
            self.fail_hard(e);
            return;
        }

        self.connect_attempts += 1;
        if self.connect_attempts == 1 {
            info!("Connecting to node at {}", self.transport.describe());
        } else {
            debug!(
                "Connect attempt {} to {}",
                self.connect_attempts,
                self.transport.describe()
            );
        }
        self.connect_deadline = Some(Instant::now() + ClientConfig::CONNECT_RETRY_DELAY);
    }

    /// The connect deadline passed without a connection.
    pub fn on_connect_timeout(&mut self) {
        self.connect_deadline = None;
        if self.closing {
            return;
        }
        if let Some(reason) = self.last_socket_error.take() {
            debug!("Last connect error: {}", reason);
        }

        match self.state {
            ClientState::TryExistingFirst => {
                info!("No running node answered, starting one");
                self.transport.abort();
                self.spawn_node();
            }
            ClientState::Connecting => {
                self.transport.abort();
                if self.connect_attempts < ClientConfig::MAX_CONNECT_ATTEMPTS {
                    self.connect_to_server();
                } else {
                    self.fail_hard(NodeError::ConnectTimeout {
                        attempts: self.connect_attempts,
                    });
                }
            }
            _ => {}
        }
    }

    fn spawn_node(&mut self) {
        self.connect_attempts = 0;
        let launch = self.settings.launch_config();
        if let Err(e) = launch.validate() {
            self.fail_hard(e);
            return;
        }

        self.set_state(ClientState::Spawning);
        if let Err(e) = self
            .supervisor
            .spawn(&launch, Arc::clone(&self.log_sink), &self.channels.process)
        {
            self.fail_hard(e);
        }
    }

    pub fn on_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Started { pid } => {
                if self.state != ClientState::Spawning {
                    debug!("Ignoring node start in state {}", self.state);
                    return;
                }
                info!("Node started (pid {:?}), connecting", pid);
                self.set_state(ClientState::Connecting);
                self.connect_to_server();
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    pub fn on_transport_event(&mut self, event: TransportEvent) {
        if !self.transport.observe(&event) {
            debug!("Dropping event from a superseded connection");
            return;
        }
        match event.kind {
            TransportEventKind::Connected => self.connected_to_server(),
            TransportEventKind::Data(chunk) => self.on_data(&chunk),
            TransportEventKind::Disconnected => self.disconnected_from_server(),
            TransportEventKind::Error(message) => {
                debug!("Socket error: {}", message);
                self.last_socket_error = Some(message);
            }
        }
    }

    fn connected_to_server(&mut self) {
        if !matches!(
            self.state,
            ClientState::TryExistingFirst | ClientState::Connecting
        ) {
            warn!("Unexpected connection in state {}, closing it", self.state);
            self.transport.disconnect();
            return;
        }

        self.connect_deadline = None;
        self.last_socket_error = None;
        // A node we launched ourselves may still be up after a restart.
        let attached = self.state == ClientState::TryExistingFirst && !self.supervisor.is_running();
        info!("Connected to node at {}", self.transport.describe());
        self.set_state(ClientState::Connected);

        self.external = attached;
        if attached {
            info!("Attached to a running node");
            self.log_sink.append(ATTACHED_LOG_LINE);
        }
        self.emit(NodeEvent::ExternalNodeAttached(attached));

        // Release the connect reservation and flush anything queued meanwhile.
        self.finish();

        self.get_client_version();
        self.get_block_number();
        self.new_block_filter();
        self.get_net_version();
    }

    fn on_data(&mut self, chunk: &[u8]) {
        self.framer.extend(chunk);
        loop {
            match self.framer.next_frame() {
                Ok(Some(frame)) => self.on_frame(&frame),
                Ok(None) => break,
                Err(e) => {
                    self.fail_hard(e);
                    break;
                }
            }
        }
    }

    fn on_frame(&mut self, frame: &[u8]) {
        let Some(request) = self.dispatcher.active_request().cloned() else {
            warn!(
                "Dropping response with no request in flight: {}",
                String::from_utf8_lossy(frame)
            );
            return;
        };
        debug!(
            "Received #{}: {}",
            request.call_id(),
            String::from_utf8_lossy(frame)
        );

        match read_reply(frame, &request).and_then(|result| self.handle_reply(&request, result)) {
            Ok(()) => self.finish(),
            Err(e) => self.fail_request(&request, e),
        }
    }

    fn disconnected_from_server(&mut self) {
        self.framer.clear();
        if self.closing {
            info!("Disconnected from node");
            self.dispatcher.reset();
            self.report_busy();
            return;
        }
        if self.state == ClientState::Error {
            debug!("Connection closed after failure");
            return;
        }
        let message = self
            .last_socket_error
            .take()
            .unwrap_or_else(|| "Connection to the node was closed".to_string());
        self.fail_hard(NodeError::transport(message));
    }

    // ------------------------------------------------------------------
    // Request plumbing
    // ------------------------------------------------------------------

    pub(super) fn prepare(&mut self, kind: RequestKind, method: &str, params: Vec<Value>) -> Request {
        self.dispatcher.prepare(kind, method, params)
    }

    /// Write or queue `request`. Returns its call id, or `None` if it was
    /// not accepted.
    pub(super) fn submit(&mut self, request: Request) -> Option<u64> {
        if !self.dispatcher.has_active()
            && !self.transport.is_writable()
            && !self.state.is_session()
        {
            self.refuse(NodeError::transport(format!(
                "Not connected to the node, dropping {}",
                request.method()
            )));
            return None;
        }

        let id = request.call_id();
        match self.dispatcher.submit(request, self.transport.as_mut()) {
            Ok(_) => {
                self.report_busy();
                Some(id)
            }
            Err(e) => {
                self.fail_hard(e);
                None
            }
        }
    }

    fn call(&mut self, kind: RequestKind, method: &str, params: Vec<Value>) -> Option<u64> {
        let request = self.prepare(kind, method, params);
        self.submit(request)
    }

    fn call_for(&mut self, kind: RequestKind, method: &str, params: Vec<Value>, index: usize) -> Option<u64> {
        let request = self.prepare(kind, method, params).with_target(index);
        self.submit(request)
    }

    /// Background poll, skipped while an identical call is outstanding.
    fn submit_poll(&mut self, kind: RequestKind, method: &str, params: Vec<Value>) {
        if self.dispatcher.is_pending(method, &params) {
            debug!("Skipping {}, already pending", method);
            return;
        }
        self.call(kind, method, params);
    }

    /// Complete the active request and write the next one.
    pub(super) fn finish(&mut self) {
        if let Err(e) = self.dispatcher.complete(self.transport.as_mut()) {
            self.fail_hard(e);
            return;
        }
        self.report_busy();
    }

    /// Report an error that touches neither the session nor the queue.
    pub(super) fn refuse(&self, err: NodeError) {
        warn!("{}", err);
        self.emit(NodeEvent::error(&err));
    }

    fn fail_request(&mut self, request: &Request, err: NodeError) {
        match request.kind() {
            RequestKind::NewBlockFilter => self.filters.install_failed(FilterKind::Block),
            RequestKind::NewEventFilter => self.filters.install_failed(FilterKind::Event),
            RequestKind::UninstallFilter => {
                if let Some(id) = request.first_param_str() {
                    if self.filters.uninstall_finished(id).is_some() {
                        warn!("Uninstalling filter {} failed, forgetting it", id);
                        self.after_uninstall();
                    }
                }
            }
            _ => {}
        }

        let policy = if err.is_connection_fault() {
            FailurePolicy::Hard
        } else {
            match (&err, request.kind().failure_policy()) {
                (NodeError::Rpc { .. } | NodeError::MissingResult { .. }, policy) => policy,
                (_, FailurePolicy::SoftClearQueue) => FailurePolicy::SoftClearQueue,
                _ => FailurePolicy::Soft,
            }
        };

        match policy {
            FailurePolicy::Hard => self.fail_hard(err),
            FailurePolicy::Soft => self.fail_soft(err, false),
            FailurePolicy::SoftClearQueue => self.fail_soft(err, true),
        }
    }

    /// Tear the session down: stop polling, drop every request.
    pub(super) fn fail_hard(&mut self, err: NodeError) {
        error!("{}", err);
        self.connect_deadline = None;
        self.stop_polling();
        self.dispatcher.reset();
        self.filters.abandon_pending();
        self.emit(NodeEvent::error(&err));

        if !self.closing && self.state != ClientState::Error && self.state.can_transition_to(ClientState::Error) {
            self.set_state(ClientState::Error);
        } else {
            self.emit(NodeEvent::ConnectionStateChanged(self.state));
        }
        self.report_busy();
    }

    /// Drop the failed request and carry on.
    pub(super) fn fail_soft(&mut self, err: NodeError, clear_queue: bool) {
        error!("{}", err);
        self.emit(NodeEvent::error(&err));
        if clear_queue {
            self.dispatcher.clear_queue();
        }
        self.finish();
    }

    // ------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------

    fn start_polling(&mut self) {
        if !self.polling {
            debug!("Polling every {:?}", self.poll_interval);
            self.polling = true;
            self.poll_generation += 1;
        }
    }

    fn stop_polling(&mut self) {
        if self.polling {
            debug!("Polling stopped");
            self.polling = false;
            self.poll_generation += 1;
        }
    }

    pub fn on_poll_tick(&mut self) {
        if !self.polling || self.closing {
            return;
        }
        self.submit_poll(RequestKind::GetPeerCount, "net_peerCount", vec![]);
        self.submit_poll(RequestKind::GetSyncing, "eth_syncing", vec![]);

        let block_filter = self.filters.id(FilterKind::Block).map(str::to_string);
        match block_filter {
            Some(id) if self.state != ClientState::Syncing => {
                self.submit_poll(RequestKind::GetFilterChanges, "eth_getFilterChanges", vec![json!(id)]);
            }
            _ => self.submit_poll(RequestKind::GetBlockNumber, "eth_blockNumber", vec![]),
        }

        if let Some(id) = self.filters.id(FilterKind::Event).map(str::to_string) {
            self.submit_poll(RequestKind::GetFilterChanges, "eth_getFilterChanges", vec![json!(id)]);
        }
    }

    /// Change the poll interval. Takes effect at once.
    pub fn set_poll_interval(&mut self, interval_ms: u64) {
        let interval = Duration::from_millis(interval_ms).max(ClientConfig::MIN_POLL_INTERVAL);
        info!("Poll interval set to {:?}", interval);
        self.poll_interval = interval;
        self.settings.set_poll_interval(interval);
        self.poll_generation += 1;
        self.emit(NodeEvent::PollIntervalChanged(interval));
    }

    /// Handshake done: start polling.
    pub(super) fn ipc_ready(&mut self) {
        info!("Node connection ready");
        self.start_polling();
        self.emit(NodeEvent::ConnectionEstablished);
        self.emit(NodeEvent::ConnectionStateChanged(self.state));
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Advance the orderly shutdown by one step.
    ///
    /// Returns true once the filters are removed, the socket is closed and
    /// the node process (if spawned here) has exited. Call again until it
    /// does.
    pub fn close_app(&mut self) -> bool {
        if !self.closing {
            info!("Closing node client");
            self.closing = true;
            self.stop_polling();
            self.connect_deadline = None;
            self.emit(NodeEvent::ClosingChanged(true));
            self.set_state(ClientState::Closing);
        }
        if self.state == ClientState::Terminated {
            return true;
        }

        let socket = self.transport.state();
        if socket == SocketState::Connected {
            if self.dispatcher.has_active() {
                return false;
            }
            if !self.close_filters_sent {
                self.close_filters_sent = true;
                for kind in [FilterKind::Block, FilterKind::Event] {
                    if let Some(id) = self.filters.begin_uninstall(kind) {
                        info!("Uninstalling {:?} filter {}", kind, id);
                        self.send_uninstall(id);
                    }
                }
            }
            if self.filters.has_uninstall_pending() || self.dispatcher.has_active() {
                return false;
            }
            info!("Disconnecting from node");
            self.dispatcher.reserve();
            self.report_busy();
        }
        if socket != SocketState::Unconnected {
            self.transport.disconnect();
            if self.transport.state() != SocketState::Unconnected {
                return false;
            }
        }

        match self.supervisor.poll_terminate() {
            Termination::Pending => false,
            outcome => {
                info!("Node client closed ({:?})", outcome);
                self.dispatcher.reset();
                self.report_busy();
                self.set_state(ClientState::Terminated);
                true
            }
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    pub fn get_accounts(&mut self) {
        self.call(RequestKind::GetAccounts, "personal_listAccounts", vec![]);
    }

    pub fn new_account(&mut self, password: &str, index: usize) {
        self.call_for(
            RequestKind::NewAccount,
            "personal_newAccount",
            vec![json!(password)],
            index,
        );
    }

    pub fn delete_account(&mut self, hash: &str, password: &str, index: usize) {
        self.call_for(
            RequestKind::DeleteAccount,
            "personal_deleteAccount",
            vec![json!(hash), json!(password)],
            index,
        );
    }

    /// Fetch balance and transaction count for the account at `index`.
    pub fn refresh_account(&mut self, hash: &str, index: usize) {
        self.get_balance(hash, index);
        self.get_transaction_count(hash, index);
    }

    pub fn get_balance(&mut self, hash: &str, index: usize) {
        self.call_for(
            RequestKind::GetBalance,
            "eth_getBalance",
            vec![json!(hash), json!("latest")],
            index,
        );
    }

    pub fn get_transaction_count(&mut self, hash: &str, index: usize) {
        self.call_for(
            RequestKind::GetTransactionCount,
            "eth_getTransactionCount",
            vec![json!(hash), json!("latest")],
            index,
        );
    }

    pub fn get_block_number(&mut self) {
        self.call(RequestKind::GetBlockNumber, "eth_blockNumber", vec![]);
    }

    pub fn get_peer_count(&mut self) {
        self.call(RequestKind::GetPeerCount, "net_peerCount", vec![]);
    }

    /// Sign and send a transaction. Malformed amounts are reported without
    /// contacting the node.
    pub fn send_transaction(&mut self, transaction: &TransactionRequest, password: &str) {
        let object = match transaction.to_params() {
            Ok(object) => object,
            Err(e) => {
                self.refuse(e);
                return;
            }
        };
        self.call(
            RequestKind::SendTransaction,
            "personal_signAndSendTransaction",
            vec![object, json!(password)],
        );
    }

    pub fn unlock_account(&mut self, hash: &str, password: &str, duration_secs: u64, index: usize) {
        self.call_for(
            RequestKind::UnlockAccount,
            "personal_unlockAccount",
            vec![
                json!(hash),
                json!(password),
                json!(units::to_hex(u128::from(duration_secs))),
            ],
            index,
        );
    }

    pub fn get_gas_price(&mut self) {
        self.call(RequestKind::GetGasPrice, "eth_gasPrice", vec![]);
    }

    pub fn estimate_gas(&mut self, transaction: &TransactionRequest) {
        match transaction.to_params() {
            Ok(object) => {
                self.call(RequestKind::EstimateGas, "eth_estimateGas", vec![object]);
            }
            Err(e) => self.refuse(e),
        }
    }

    pub fn get_transaction_by_hash(&mut self, hash: &str) {
        self.call(
            RequestKind::GetTransactionByHash,
            "eth_getTransactionByHash",
            vec![json!(hash)],
        );
    }

    /// Fetch a block with full transaction bodies.
    pub fn get_block_by_hash(&mut self, hash: &str) {
        self.call(
            RequestKind::GetBlock,
            "eth_getBlockByHash",
            vec![json!(hash), json!(true)],
        );
    }

    pub fn get_block_by_number(&mut self, number: u64) {
        self.call(
            RequestKind::GetBlock,
            "eth_getBlockByNumber",
            vec![json!(units::to_hex(u128::from(number))), json!(true)],
        );
    }

    pub fn get_transaction_receipt(&mut self, hash: &str) {
        self.call(
            RequestKind::GetTransactionReceipt,
            "eth_getTransactionReceipt",
            vec![json!(hash)],
        );
    }

    pub fn get_client_version(&mut self) {
        self.call(RequestKind::GetClientVersion, "web3_clientVersion", vec![]);
    }

    pub fn get_net_version(&mut self) {
        self.call(RequestKind::GetNetVersion, "net_version", vec![]);
    }

    pub fn get_syncing(&mut self) {
        self.call(RequestKind::GetSyncing, "eth_syncing", vec![]);
    }

    /// Install the block filter. Refused while one is tracked.
    pub fn new_block_filter(&mut self) {
        if let Err(e) = self.filters.begin_install(FilterKind::Block) {
            self.refuse(e);
            return;
        }
        if self
            .call(RequestKind::NewBlockFilter, "eth_newBlockFilter", vec![])
            .is_none()
        {
            self.filters.install_failed(FilterKind::Block);
        }
    }

    /// Watch logs from `addresses`, replacing the current event filter.
    ///
    /// An empty address list only removes the current filter.
    pub fn register_event_filters(&mut self, addresses: Vec<String>, topics: Vec<String>) {
        let spec = EventFilterSpec::new(addresses, topics);

        if self.filters.id(FilterKind::Event).is_some() || self.filters.is_uninstalling(FilterKind::Event) {
            if let Some(id) = self.filters.begin_uninstall(FilterKind::Event) {
                self.send_uninstall(id);
            }
            if spec.is_empty() {
                self.filters.take_deferred_event();
            } else {
                self.filters.defer_event_install(spec);
            }
            return;
        }

        if !spec.is_empty() {
            self.install_event_filter(spec);
        }
    }

    pub(super) fn install_event_filter(&mut self, spec: EventFilterSpec) {
        if let Err(e) = self.filters.begin_install(FilterKind::Event) {
            self.refuse(e);
            return;
        }
        if self
            .call(RequestKind::NewEventFilter, "eth_newFilter", spec.filter_params())
            .is_none()
        {
            self.filters.install_failed(FilterKind::Event);
        }
    }

    /// Fetch past logs from `from_block` (0 for latest).
    pub fn load_logs(&mut self, addresses: Vec<String>, topics: Vec<String>, from_block: u64) {
        let spec = EventFilterSpec::new(addresses, topics);
        self.call(RequestKind::GetLogs, "eth_getLogs", spec.logs_params(from_block));
    }

    /// Remove the filter with this id.
    pub fn uninstall_filter(&mut self, id: &str) {
        if id.is_empty() {
            self.refuse(NodeError::protocol("Filter not set"));
            return;
        }
        if let Some(kind) = self.filters.kind_of(id) {
            self.filters.begin_uninstall(kind);
        }
        self.send_uninstall(id.to_string());
    }

    pub(super) fn send_uninstall(&mut self, id: String) {
        if self
            .call(RequestKind::UninstallFilter, "eth_uninstallFilter", vec![json!(id)])
            .is_none()
        {
            // Never reached the node; the filter is still there.
            self.filters.abandon_pending();
        }
    }

    /// Run installs that were waiting for an uninstall to finish.
    pub(super) fn after_uninstall(&mut self) {
        if self.closing {
            return;
        }
        if !self.filters.is_tracked(FilterKind::Block)
            && self.filters.take_block_reinstall()
            && self.state != ClientState::Syncing
        {
            self.new_block_filter();
        }
        if !self.filters.is_tracked(FilterKind::Event) {
            if let Some(spec) = self.filters.take_deferred_event() {
                self.install_event_filter(spec);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::harness::Harness;

    #[test]
    fn test_init_connects_and_reserves() {
        let mut h = Harness::new();
        h.core.init().unwrap();

        assert_eq!(h.core.state(), ClientState::TryExistingFirst);
        assert_eq!(h.mock.connects(), 1);
        assert!(h.core.connect_deadline().is_some());

        let events = h.drain();
        assert!(events.contains(&NodeEvent::ConnectionStateChanged(ClientState::TryExistingFirst)));
        assert!(events.contains(&NodeEvent::StartingStageChanged(StartingStage::TryExistingFirst)));
        assert!(events.contains(&NodeEvent::BusyChanged(true)));
    }

    #[test]
    fn test_init_twice_is_refused() {
        let mut h = Harness::new();
        h.core.init().unwrap();
        assert!(h.core.init().is_err());
        assert_eq!(h.mock.connects(), 1);
    }

    #[test]
    fn test_attach_runs_handshake_in_order() {
        let mut h = Harness::new();
        h.attach();

        assert_eq!(h.core.state(), ClientState::Connected);
        assert_eq!(h.mock.written_methods(), vec!["web3_clientVersion"]);
        assert!(h.log.contents().contains("Attached to external node"));

        h.answer(json!("Gdbix/v1.5.2-stable/linux/go1.9"));
        h.answer(json!("0x10"));
        h.answer(json!("0xb1"));
        h.answer(json!("1"));

        assert_eq!(
            h.mock.written_methods(),
            vec!["web3_clientVersion", "eth_blockNumber", "eth_newBlockFilter", "net_version"]
        );
        let events = h.drain();
        assert!(events.contains(&NodeEvent::ExternalNodeAttached(true)));
        assert!(events.contains(&NodeEvent::ConnectionEstablished));
        assert!(h.core.poll_schedule().is_some());

        let snapshot = h.core.snapshot();
        assert!(snapshot.external);
        assert_eq!(snapshot.block_number, 16);
        assert_eq!(snapshot.block_filter_id.as_deref(), Some("0xb1"));
        assert_eq!(snapshot.network_version, Some(1));
        assert!(!snapshot.busy);
    }

    #[test]
    fn test_busy_clears_after_handshake() {
        let mut h = Harness::new();
        h.ready();
        let busy: Vec<bool> = h
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                NodeEvent::BusyChanged(busy) => Some(busy),
                _ => None,
            })
            .collect();
        // Reserved while connecting, busy again for the filter install.
        assert_eq!(busy, vec![true, false, true, false]);
        assert!(!h.core.snapshot().busy);
    }

    #[test]
    fn test_queued_request_written_after_reply() {
        let mut h = Harness::new();
        h.ready();
        let before = h.mock.write_count();

        h.core.get_block_number();
        let first = h.last_id();
        h.core.get_peer_count();
        assert_eq!(h.mock.write_count(), before + 1);
        assert_eq!(h.core.snapshot().queue_length, 1);

        h.reply(first, json!("0x20"));
        assert_eq!(h.mock.write_count(), before + 2);
        assert_eq!(h.mock.last_written()["method"], json!("net_peerCount"));
        assert_eq!(h.mock.last_written()["id"], json!(first + 1));
        assert!(h.drain().contains(&NodeEvent::BlockNumberChanged(32)));
    }

    #[test]
    fn test_id_mismatch_is_hard_failure() {
        let mut h = Harness::new();
        h.ready();
        h.core.get_block_number();
        let id = h.last_id();
        h.core.get_peer_count();
        h.core.get_gas_price();

        h.reply(id + 7, json!("0x1"));

        assert_eq!(h.core.state(), ClientState::Error);
        let snapshot = h.core.snapshot();
        assert_eq!(snapshot.queue_length, 0);
        assert!(!snapshot.busy);
        assert!(h.core.poll_schedule().is_none());

        let events = h.drain();
        assert!(events.iter().any(|e| matches!(
            e,
            NodeEvent::ErrorRaised { message, code: 0 } if message.contains("Call number mismatch")
        )));
        assert!(events.contains(&NodeEvent::ConnectionStateChanged(ClientState::Error)));
    }

    #[test]
    fn test_late_reply_after_failure_is_dropped() {
        let mut h = Harness::new();
        h.ready();
        h.core.get_block_number();
        let id = h.last_id();
        h.reply(id + 1, json!("0x1"));
        h.drain();

        h.reply(id, json!("0x1"));
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_rpc_error_on_user_request_is_soft() {
        let mut h = Harness::new();
        h.ready();
        h.core.get_gas_price();
        let id = h.last_id();
        h.core.get_peer_count();

        h.deliver_error(id, -32000, "no gas oracle");

        assert_eq!(h.core.state(), ClientState::Connected);
        assert_eq!(h.mock.last_written()["method"], json!("net_peerCount"));
        assert!(h.core.poll_schedule().is_some());
        assert!(h.drain().contains(&NodeEvent::ErrorRaised {
            message: "no gas oracle".into(),
            code: -32000
        }));
    }

    #[test]
    fn test_rpc_error_on_session_request_is_hard() {
        let mut h = Harness::new();
        h.ready();
        h.core.get_accounts();
        let id = h.last_id();
        h.deliver_error(id, -32601, "method not found");
        assert_eq!(h.core.state(), ClientState::Error);
    }

    #[test]
    fn test_reply_before_garbage_is_still_handled() {
        let mut h = Harness::new();
        h.ready();
        h.drain();
        h.core.get_accounts();
        let id = h.last_id();

        let reply = json!({"jsonrpc": "2.0", "id": id, "result": ["0xaa"]}).to_string();
        let chunk = h.mock.data(&format!("{}\nnot json", reply));
        h.deliver(chunk);

        let events = h.drain();
        assert!(events.contains(&NodeEvent::AccountsListed(vec![AccountInfo::new("0xaa")])));
        assert!(events.iter().any(|e| matches!(
            e,
            NodeEvent::ErrorRaised { message, .. } if message.contains("not a JSON object")
        )));
        assert_eq!(h.core.state(), ClientState::Error);
        assert_eq!(h.core.framer.pending(), 0);
    }

    #[test]
    fn test_unlock_failure_clears_queue_keeps_polling() {
        let mut h = Harness::new();
        h.ready();
        h.core.unlock_account("0xabc", "pw", 60, 0);
        let id = h.last_id();
        h.core.get_gas_price();
        h.core.get_peer_count();
        let writes = h.mock.write_count();

        h.deliver_error(id, -32000, "could not decrypt key");

        assert_eq!(h.mock.write_count(), writes);
        assert_eq!(h.core.snapshot().queue_length, 0);
        assert!(h.core.poll_schedule().is_some());
        assert_eq!(h.core.state(), ClientState::Connected);
    }

    #[test]
    fn test_uninstall_empty_id_writes_nothing() {
        let mut h = Harness::new();
        h.ready();
        h.core.get_block_number();
        let writes = h.mock.write_count();
        let active = h.core.dispatcher.active_request().map(Request::call_id);

        h.core.uninstall_filter("");

        assert_eq!(h.mock.write_count(), writes);
        assert_eq!(h.core.dispatcher.active_request().map(Request::call_id), active);
        assert!(h.drain().iter().any(|e| matches!(
            e,
            NodeEvent::ErrorRaised { message, .. } if message.contains("Filter not set")
        )));
    }

    #[test]
    fn test_block_filter_install_refused_while_set() {
        let mut h = Harness::new();
        h.ready();
        let writes = h.mock.write_count();

        h.core.new_block_filter();

        assert_eq!(h.mock.write_count(), writes);
        assert_eq!(h.core.state(), ClientState::Connected);
        assert!(h.drain().iter().any(|e| matches!(
            e,
            NodeEvent::ErrorRaised { message, .. } if message.contains("Filter already set")
        )));
    }

    #[test]
    fn test_poll_tick_requests() {
        let mut h = Harness::new();
        h.ready();
        h.core.register_event_filters(vec!["0xc0ffee".into()], vec![]);
        let id = h.last_id();
        h.reply(id, json!("0xe1"));

        let before = h.mock.write_count();
        h.core.on_poll_tick();
        h.answer(json!("0x3"));
        h.answer(json!(false));
        h.answer(json!([]));
        h.answer(json!([]));

        let methods = h.mock.written_methods()[before..].to_vec();
        assert_eq!(
            methods,
            vec!["net_peerCount", "eth_syncing", "eth_getFilterChanges", "eth_getFilterChanges"]
        );
        let written = h.mock.written();
        assert_eq!(written[before + 2]["params"], json!(["0xb1"]));
        assert_eq!(written[before + 3]["params"], json!(["0xe1"]));
        assert_eq!(h.core.state(), ClientState::Synced);
    }

    #[test]
    fn test_block_filter_install_error_is_hard() {
        let mut h = Harness::new();
        h.attach();
        h.answer(json!("Gdbix/v1.5.2"));
        h.answer(json!("0x10"));
        h.deliver_error(h.last_id(), -32000, "filters disabled");
        // A failed block filter install is a session-level failure.
        assert_eq!(h.core.state(), ClientState::Error);
    }

    #[test]
    fn test_poll_coalescing() {
        let mut h = Harness::new();
        h.ready();
        h.core.get_accounts();

        h.core.on_poll_tick();
        let queued = h.core.snapshot().queue_length;
        h.core.on_poll_tick();
        assert_eq!(h.core.snapshot().queue_length, queued);

        // User requests are never coalesced.
        h.core.get_gas_price();
        h.core.get_gas_price();
        assert_eq!(h.core.snapshot().queue_length, queued + 2);
    }

    #[test]
    fn test_set_poll_interval() {
        let mut h = Harness::new();
        h.ready();
        let (generation, _) = h.core.poll_schedule().unwrap();

        h.core.set_poll_interval(2500);
        let (next, interval) = h.core.poll_schedule().unwrap();
        assert_ne!(generation, next);
        assert_eq!(interval, Duration::from_millis(2500));
        assert_eq!(h.core.settings().poll_interval_secs, 3);
        assert!(h.drain().contains(&NodeEvent::PollIntervalChanged(Duration::from_millis(2500))));

        h.core.set_poll_interval(0);
        assert_eq!(h.core.poll_schedule().unwrap().1, ClientConfig::MIN_POLL_INTERVAL);
        assert!(h.core.settings().poll_interval_secs >= 1);
    }

    #[test]
    fn test_syncing_uninstalls_and_reinstalls_block_filter() {
        let mut h = Harness::new();
        h.ready();

        h.core.get_syncing();
        h.answer(json!({"currentBlock": "0x10", "highestBlock": "0x100", "startingBlock": "0x0"}));
        assert_eq!(h.core.state(), ClientState::Syncing);
        assert_eq!(h.mock.last_written()["method"], json!("eth_uninstallFilter"));
        let events = h.drain();
        assert!(events.contains(&NodeEvent::SyncingChanged(SyncStatus {
            syncing: true,
            current_block: 16,
            highest_block: 256,
            starting_block: 0,
        })));

        // While syncing the block number is polled instead of the filter.
        h.answer(json!(true));
        assert_eq!(h.core.snapshot().block_filter_id, None);
        h.core.on_poll_tick();
        h.answer(json!("0x5"));
        h.answer(json!({"currentBlock": "0x20", "highestBlock": "0x100", "startingBlock": "0x0"}));
        h.answer(json!("0x20"));
        assert!(h.mock.written_methods().contains(&"eth_blockNumber".to_string()));

        h.core.get_syncing();
        h.answer(json!(false));
        assert_eq!(h.core.state(), ClientState::Synced);
        assert_eq!(h.mock.last_written()["method"], json!("eth_newBlockFilter"));
        h.answer(json!("0xb2"));
        assert_eq!(h.core.snapshot().block_filter_id.as_deref(), Some("0xb2"));
    }

    #[test]
    fn test_sync_exit_while_uninstall_in_flight_defers_reinstall() {
        let mut h = Harness::new();
        h.ready();

        h.core.get_syncing();
        h.core.get_syncing();
        h.answer(json!({"currentBlock": "0x1", "highestBlock": "0x2", "startingBlock": "0x0"}));
        // Second sync reply arrives before the uninstall ack.
        h.answer(json!(false));
        assert_eq!(h.core.state(), ClientState::Synced);
        assert_eq!(h.mock.last_written()["method"], json!("eth_uninstallFilter"));

        h.answer(json!(true));
        assert_eq!(h.mock.last_written()["method"], json!("eth_newBlockFilter"));
    }

    #[test]
    fn test_event_filter_replacement() {
        let mut h = Harness::new();
        h.ready();
        h.core.register_event_filters(vec!["0xa".into()], vec!["0xt".into()]);
        assert_eq!(
            h.mock.last_written()["params"],
            json!([{"address": ["0xa"], "topics": ["0xt"]}])
        );
        h.answer(json!("0xe1"));

        h.core.register_event_filters(vec!["0xb".into()], vec![]);
        assert_eq!(h.mock.last_written()["method"], json!("eth_uninstallFilter"));
        h.answer(json!(true));
        assert_eq!(h.mock.last_written()["method"], json!("eth_newFilter"));
        assert_eq!(h.mock.last_written()["params"], json!([{"address": ["0xb"]}]));
        h.answer(json!("0xe2"));
        assert_eq!(h.core.snapshot().event_filter_id.as_deref(), Some("0xe2"));

        h.core.register_event_filters(vec![], vec![]);
        h.answer(json!(true));
        assert_eq!(h.core.snapshot().event_filter_id, None);
        assert_eq!(h.mock.last_written()["method"], json!("eth_uninstallFilter"));
    }

    #[test]
    fn test_send_transaction_with_bad_amount_writes_nothing() {
        let mut h = Harness::new();
        h.ready();
        let writes = h.mock.write_count();

        h.core
            .send_transaction(&TransactionRequest::new("0xa", "0xb", "1.2.3"), "pw");

        assert_eq!(h.mock.write_count(), writes);
        assert_eq!(h.core.state(), ClientState::Connected);
        assert!(h.drain().iter().any(|e| matches!(e, NodeEvent::ErrorRaised { .. })));
    }

    #[test]
    fn test_command_before_start_is_refused_locally() {
        let mut h = Harness::new();
        h.core.get_gas_price();
        assert_eq!(h.core.state(), ClientState::NotStarted);
        assert_eq!(h.mock.write_count(), 0);
        assert!(h.drain().iter().any(|e| matches!(e, NodeEvent::ErrorRaised { .. })));
    }

    #[test]
    fn test_command_while_connecting_waits() {
        let mut h = Harness::new();
        h.core.init().unwrap();
        h.core.get_accounts();
        assert_eq!(h.mock.write_count(), 0);

        let connected = h.mock.connected();
        h.deliver(connected);
        assert_eq!(h.mock.written_methods()[0], "personal_listAccounts");
    }

    #[test]
    fn test_missing_binary_fails_without_spawn_connect() {
        let mut h = Harness::new();
        h.core.init().unwrap();
        h.core.on_connect_timeout();

        assert_eq!(h.core.state(), ClientState::Error);
        assert_eq!(h.core.stage(), StartingStage::Failed);
        assert_eq!(h.mock.connects(), 1);
        assert!(h.process_rx.try_recv().is_err());
        assert!(h.drain().iter().any(|e| matches!(
            e,
            NodeEvent::ErrorRaised { message, .. } if message.contains("Could not find the node")
        )));
    }

    #[test]
    fn test_connect_gives_up_after_max_attempts() {
        let mut h = Harness::new();
        h.core.init().unwrap();
        h.core.state = ClientState::Connecting;
        h.core.connect_attempts = 1;

        for _ in 1..ClientConfig::MAX_CONNECT_ATTEMPTS {
            h.core.on_connect_timeout();
            assert_eq!(h.core.state(), ClientState::Connecting);
        }
        assert_eq!(h.core.connect_attempts, ClientConfig::MAX_CONNECT_ATTEMPTS);

        h.core.on_connect_timeout();
        assert_eq!(h.core.state(), ClientState::Error);
        assert!(h.core.connect_deadline().is_none());
        let connects = h.mock.connects();
        h.core.on_connect_timeout();
        assert_eq!(h.mock.connects(), connects);
        assert!(h.drain().iter().any(|e| matches!(
            e,
            NodeEvent::ErrorRaised { message, .. } if message.contains("after 20 attempts")
        )));
    }

    #[test]
    fn test_stale_connect_event_ignored() {
        let mut h = Harness::new();
        h.core.init().unwrap();
        let stale = h.mock.connected();
        h.core.state = ClientState::Connecting;
        h.core.connect_attempts = 1;
        h.core.on_connect_timeout();

        h.deliver(stale);
        assert_eq!(h.core.state(), ClientState::Connecting);
        assert_eq!(h.mock.write_count(), 0);
    }

    #[test]
    fn test_unexpected_disconnect_is_hard_failure() {
        let mut h = Harness::new();
        h.ready();
        let disconnected = h.mock.disconnected();
        h.deliver(disconnected);
        assert_eq!(h.core.state(), ClientState::Error);
        assert!(h.core.poll_schedule().is_none());
    }

    #[test]
    fn test_reinit_after_failure() {
        let mut h = Harness::new();
        h.ready();
        let disconnected = h.mock.disconnected();
        h.deliver(disconnected);

        h.core.init().unwrap();
        assert_eq!(h.core.state(), ClientState::TryExistingFirst);
        assert_eq!(h.core.snapshot().block_filter_id, None);
        let connected = h.mock.connected();
        h.deliver(connected);
        assert_eq!(h.mock.last_written()["method"], json!("web3_clientVersion"));
    }

    /// Stand-in for a node process we launched earlier.
    struct OwnedChild {
        exited: bool,
    }

    impl crate::process::ChildProcess for OwnedChild {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        fn has_exited(&mut self) -> std::io::Result<bool> {
            Ok(self.exited)
        }

        fn request_stop(&mut self) -> std::io::Result<()> {
            self.exited = true;
            Ok(())
        }

        fn kill(&mut self) -> std::io::Result<()> {
            self.exited = true;
            Ok(())
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reinit_respawns_after_own_node_crashed() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::TempDir::new().unwrap();
        let script = temp_dir.path().join("gdbix");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut h = Harness::with_settings(|s| s.node_path = script.clone());
        h.core.supervisor.adopt(Box::new(OwnedChild { exited: true }));
        h.ready();
        let disconnected = h.mock.disconnected();
        h.deliver(disconnected);
        assert_eq!(h.core.state(), ClientState::Error);

        h.core.init().unwrap();
        h.core.on_connect_timeout();
        assert_eq!(h.core.state(), ClientState::Spawning);

        let event = h.process_rx.recv().await.unwrap();
        assert!(matches!(event, ProcessEvent::Started { pid: Some(pid) } if pid != 4242));
        h.core.on_process_event(event);
        assert_eq!(h.core.state(), ClientState::Connecting);
        assert!(!h.drain().iter().any(|e| matches!(e, NodeEvent::ErrorRaised { .. })));
    }

    #[test]
    fn test_reconnect_to_own_node_is_not_external() {
        let mut h = Harness::new();
        h.core.supervisor.adopt(Box::new(OwnedChild { exited: false }));
        h.core.init().unwrap();
        let connected = h.mock.connected();
        h.deliver(connected);

        assert!(h.drain().contains(&NodeEvent::ExternalNodeAttached(false)));
        assert!(!h.core.snapshot().external);
        assert!(!h.log.contents().contains("Attached to external node"));
    }

    #[test]
    fn test_close_uninstalls_filters_then_disconnects() {
        let mut h = Harness::new();
        h.ready();
        h.core.register_event_filters(vec!["0xa".into()], vec![]);
        h.answer(json!("0xe1"));
        h.drain();

        assert!(!h.core.close_app());
        assert!(h.core.is_closing());
        assert!(h.core.poll_schedule().is_none());
        assert_eq!(h.core.state(), ClientState::Closing);
        assert_eq!(h.mock.last_written()["params"], json!(["0xb1"]));

        assert!(!h.core.close_app());
        h.answer(json!(true));
        assert!(!h.core.close_app());
        h.answer(json!(true));
        assert_eq!(h.mock.last_written()["params"], json!(["0xe1"]));

        // Filters gone: the socket is asked to close.
        assert!(!h.core.close_app());
        assert_eq!(h.mock.socket_state(), SocketState::Closing);
        assert!(!h.core.close_app());

        let disconnected = h.mock.disconnected();
        h.deliver(disconnected);
        assert!(h.core.close_app());
        assert_eq!(h.core.state(), ClientState::Terminated);
        assert!(h.core.close_app());

        let events = h.drain();
        assert!(events.contains(&NodeEvent::ClosingChanged(true)));
        assert!(events.contains(&NodeEvent::ConnectionStateChanged(ClientState::Terminated)));
        assert!(!events.iter().any(|e| matches!(e, NodeEvent::ErrorRaised { .. })));
    }

    #[test]
    fn test_close_waits_for_active_request() {
        let mut h = Harness::new();
        h.ready();
        h.core.get_accounts();
        let id = h.last_id();

        assert!(!h.core.close_app());
        assert_eq!(h.mock.last_written()["method"], json!("personal_listAccounts"));

        h.reply(id, json!([]));
        assert!(!h.core.close_app());
        assert_eq!(h.mock.last_written()["method"], json!("eth_uninstallFilter"));
    }

    #[test]
    fn test_close_before_start() {
        let mut h = Harness::new();
        assert!(h.core.close_app());
        assert_eq!(h.core.state(), ClientState::Terminated);
    }

    #[test]
    fn test_close_while_connecting_aborts() {
        let mut h = Harness::new();
        h.core.init().unwrap();
        assert!(h.core.close_app());
        assert_eq!(h.mock.socket_state(), SocketState::Unconnected);
        assert!(h.core.connect_deadline().is_none());
    }
}
