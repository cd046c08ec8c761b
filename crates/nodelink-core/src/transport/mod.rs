//! Byte-stream transports to the node.
//!
//! The client core only sees the [`Transport`] trait. Implementations run
//! their socket I/O on a background task and report back through a channel
//! of [`TransportEvent`]s, which the client's event loop feeds into the core
//! one at a time.
//!
//! Every connect attempt gets a fresh epoch. Events carry the epoch they were
//! produced under, so notifications from an aborted attempt are recognised
//! and dropped by [`Transport::observe`].

mod stream;

#[cfg(test)]
pub(crate) mod mock;

pub use stream::{Connector, LocalSocketConnector, LocalSocketTransport, StreamTransport, TcpConnector, TcpTransport};

use crate::error::Result;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Connectivity of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unconnected,
    Connecting,
    Connected,
    Closing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    Connected,
    Data(Bytes),
    Disconnected,
    Error(String),
}

/// Notification from a transport's I/O task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub epoch: u64,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub fn new(epoch: u64, kind: TransportEventKind) -> Self {
        Self { epoch, kind }
    }
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// A streaming connection to the node.
pub trait Transport: Send {
    /// Human readable endpoint, for logs.
    fn describe(&self) -> String;

    fn state(&self) -> SocketState;

    /// Start connecting. Progress is reported through `events`.
    ///
    /// Fails if the transport is not unconnected.
    fn connect(&mut self, events: TransportEventSender) -> Result<()>;

    /// Drop the connection or connect attempt immediately.
    fn abort(&mut self);

    /// Close an established connection after pending writes are flushed.
    /// A `Disconnected` event follows. An attempt still connecting is aborted.
    fn disconnect(&mut self);

    fn is_writable(&self) -> bool {
        self.state() == SocketState::Connected
    }

    /// Queue bytes for sending and return how many were accepted.
    fn write(&mut self, bytes: &[u8]) -> Result<usize>;

    /// Apply an event to the transport's own state.
    ///
    /// Returns false for events from a superseded connect attempt, which the
    /// caller must ignore.
    fn observe(&mut self, event: &TransportEvent) -> bool;
}

/// State bookkeeping shared by transport implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConnectionTracker {
    pub state: SocketState,
    pub epoch: u64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            state: SocketState::Unconnected,
            epoch: 0,
        }
    }

    /// Begin a new connect attempt and return its epoch.
    pub fn begin_connect(&mut self) -> u64 {
        self.epoch += 1;
        self.state = SocketState::Connecting;
        self.epoch
    }

    /// Invalidate the current attempt.
    pub fn reset(&mut self) {
        self.epoch += 1;
        self.state = SocketState::Unconnected;
    }

    pub fn observe(&mut self, event: &TransportEvent) -> bool {
        if event.epoch != self.epoch {
            return false;
        }
        match &event.kind {
            TransportEventKind::Connected => self.state = SocketState::Connected,
            TransportEventKind::Disconnected => self.state = SocketState::Unconnected,
            TransportEventKind::Error(_) => {
                if self.state == SocketState::Connecting {
                    self.state = SocketState::Unconnected;
                }
            }
            TransportEventKind::Data(_) => {}
        }
        true
    }
}
