//! In-memory transport for driving the client core in unit tests.

use super::{ConnectionTracker, SocketState, Transport, TransportEvent, TransportEventKind, TransportEventSender};
use crate::error::{NodeError, Result};
use bytes::Bytes;
use serde_json::Value;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct Shared {
    tracker: ConnectionTracker,
    writes: Vec<Vec<u8>>,
    connects: u32,
    aborts: u32,
    fail_writes: bool,
}

/// Transport that records writes and lets tests inject events.
#[derive(Debug, Clone)]
pub(crate) struct MockTransport {
    shared: Arc<Mutex<Shared>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                tracker: ConnectionTracker::new(),
                writes: Vec::new(),
                connects: 0,
                aborts: 0,
                fail_writes: false,
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        let mut shared = self.shared.lock().unwrap();
        f(&mut shared)
    }

    pub fn event(&self, kind: TransportEventKind) -> TransportEvent {
        TransportEvent::new(self.with(|s| s.tracker.epoch), kind)
    }

    pub fn connected(&self) -> TransportEvent {
        self.event(TransportEventKind::Connected)
    }

    pub fn disconnected(&self) -> TransportEvent {
        self.event(TransportEventKind::Disconnected)
    }

    pub fn data(&self, text: &str) -> TransportEvent {
        self.event(TransportEventKind::Data(Bytes::copy_from_slice(text.as_bytes())))
    }

    /// Reply frame for `id` carrying `result`.
    pub fn reply(&self, id: u64, result: Value) -> TransportEvent {
        self.data(&serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string())
    }

    pub fn error_reply(&self, id: u64, code: i64, message: &str) -> TransportEvent {
        self.data(
            &serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message}
            })
            .to_string(),
        )
    }

    /// Every request written so far, decoded.
    pub fn written(&self) -> Vec<Value> {
        self.with(|s| {
            s.writes
                .iter()
                .map(|w| serde_json::from_slice(w).unwrap())
                .collect()
        })
    }

    pub fn written_methods(&self) -> Vec<String> {
        self.written()
            .iter()
            .map(|v| v["method"].as_str().unwrap().to_string())
            .collect()
    }

    pub fn last_written(&self) -> Value {
        self.written().pop().expect("nothing written")
    }

    pub fn write_count(&self) -> usize {
        self.with(|s| s.writes.len())
    }

    pub fn connects(&self) -> u32 {
        self.with(|s| s.connects)
    }

    pub fn aborts(&self) -> u32 {
        self.with(|s| s.aborts)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.with(|s| s.fail_writes = fail);
    }

    pub fn socket_state(&self) -> SocketState {
        self.with(|s| s.tracker.state)
    }
}

impl Transport for MockTransport {
    fn describe(&self) -> String {
        "mock".to_string()
    }

    fn state(&self) -> SocketState {
        self.socket_state()
    }

    fn connect(&mut self, _events: TransportEventSender) -> Result<()> {
        self.with(|s| {
            if s.tracker.state != SocketState::Unconnected {
                return Err(NodeError::transport("Already connected"));
            }
            s.tracker.begin_connect();
            s.connects += 1;
            Ok(())
        })
    }

    fn abort(&mut self) {
        self.with(|s| {
            s.tracker.reset();
            s.aborts += 1;
        });
    }

    fn disconnect(&mut self) {
        self.with(|s| match s.tracker.state {
            SocketState::Connected => s.tracker.state = SocketState::Closing,
            SocketState::Connecting => s.tracker.reset(),
            _ => {}
        });
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        self.with(|s| {
            if s.tracker.state != SocketState::Connected {
                return Err(NodeError::transport("Socket not writeable"));
            }
            if s.fail_writes {
                return Ok(0);
            }
            s.writes.push(bytes.to_vec());
            Ok(bytes.len())
        })
    }

    fn observe(&mut self, event: &TransportEvent) -> bool {
        self.with(|s| s.tracker.observe(event))
    }
}
