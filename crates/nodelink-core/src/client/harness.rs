//! Drives a [`ClientCore`] over a [`MockTransport`] in unit tests.

use super::core::{ClientCore, CoreChannels};
use super::events::NodeEvent;
use crate::config::ClientSettings;
use crate::process::{NodeLog, ProcessEvent};
use crate::transport::mock::MockTransport;
use crate::transport::TransportEvent;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) struct Harness {
    pub core: ClientCore,
    pub mock: MockTransport,
    pub log: Arc<NodeLog>,
    pub events: mpsc::UnboundedReceiver<NodeEvent>,
    pub process_rx: mpsc::UnboundedReceiver<ProcessEvent>,
    _transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(configure: impl FnOnce(&mut ClientSettings)) -> Self {
        let mut settings = ClientSettings {
            node_path: "/nonexistent/nodelink-test/gdbix".into(),
            data_dir: "/nonexistent/nodelink-test".into(),
            ..ClientSettings::default()
        };
        configure(&mut settings);

        let (events_tx, events) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (process_tx, process_rx) = mpsc::unbounded_channel();
        let mock = MockTransport::new();
        let log = Arc::new(NodeLog::default());
        let core = ClientCore::new(
            settings,
            Box::new(mock.clone()),
            log.clone(),
            CoreChannels {
                events: events_tx,
                transport: transport_tx,
                process: process_tx,
            },
        );
        Self {
            core,
            mock,
            log,
            events,
            process_rx,
            _transport_rx: transport_rx,
        }
    }

    pub fn drain(&mut self) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn deliver(&mut self, event: TransportEvent) {
        self.core.on_transport_event(event);
    }

    /// Call id of the most recent write.
    pub fn last_id(&self) -> u64 {
        self.mock.last_written()["id"].as_u64().unwrap()
    }

    pub fn reply(&mut self, id: u64, result: Value) {
        let event = self.mock.reply(id, result);
        self.deliver(event);
    }

    /// Answer the request in flight.
    pub fn answer(&mut self, result: Value) {
        let id = self.last_id();
        self.reply(id, result);
    }

    pub fn deliver_error(&mut self, id: u64, code: i64, message: &str) {
        let event = self.mock.error_reply(id, code, message);
        self.deliver(event);
    }

    /// Start and attach to a "running" node.
    pub fn attach(&mut self) {
        self.core.init().unwrap();
        let connected = self.mock.connected();
        self.deliver(connected);
    }

    /// Attach and answer the handshake: block filter `0xb1`, network 1.
    pub fn ready(&mut self) {
        self.attach();
        self.answer(Value::String("Gdbix/v1.5.2-stable/linux/go1.9".into()));
        self.answer(Value::String("0x10".into()));
        self.answer(Value::String("0xb1".into()));
        self.answer(Value::String("1".into()));
    }
}
