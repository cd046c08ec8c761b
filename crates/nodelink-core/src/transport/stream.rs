//! Transport over any tokio byte stream.
//!
//! A connect spawns one task that owns the stream: it reads chunks and
//! forwards them as `Data` events, and drains an unbounded queue of
//! outgoing buffers. Dropping the queue sender closes the stream.

use super::{ConnectionTracker, SocketState, Transport, TransportEvent, TransportEventKind, TransportEventSender};
use crate::config::ClientConfig;
use crate::error::{NodeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Opens the underlying stream for a [`StreamTransport`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn open(&self) -> std::io::Result<Self::Stream>;

    fn describe(&self) -> String;
}

/// Transport that runs a [`Connector`]'s stream on a background task.
pub struct StreamTransport<C: Connector> {
    connector: Arc<C>,
    tracker: ConnectionTracker,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl<C: Connector> StreamTransport<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector: Arc::new(connector),
            tracker: ConnectionTracker::new(),
            outgoing: None,
            task: None,
        }
    }

    fn stop_task(&mut self) {
        self.outgoing = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl<C: Connector> Transport for StreamTransport<C> {
    fn describe(&self) -> String {
        self.connector.describe()
    }

    fn state(&self) -> SocketState {
        self.tracker.state
    }

    fn connect(&mut self, events: TransportEventSender) -> Result<()> {
        if self.tracker.state != SocketState::Unconnected {
            return Err(NodeError::transport("Already connected"));
        }
        self.stop_task();

        let epoch = self.tracker.begin_connect();
        let (tx, rx) = mpsc::unbounded_channel();
        self.outgoing = Some(tx);
        self.task = Some(tokio::spawn(run_connection(
            Arc::clone(&self.connector),
            epoch,
            events,
            rx,
        )));
        Ok(())
    }

    fn abort(&mut self) {
        self.stop_task();
        self.tracker.reset();
    }

    fn disconnect(&mut self) {
        match self.tracker.state {
            SocketState::Connected => {
                self.tracker.state = SocketState::Closing;
                // The task flushes what is queued, shuts the stream down and
                // reports Disconnected.
                self.outgoing = None;
            }
            SocketState::Connecting => self.abort(),
            SocketState::Closing | SocketState::Unconnected => {}
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if !self.is_writable() {
            return Err(NodeError::transport("Socket not writeable"));
        }
        let Some(outgoing) = self.outgoing.as_ref() else {
            return Err(NodeError::transport("Socket not writeable"));
        };
        outgoing
            .send(bytes.to_vec())
            .map_err(|_| NodeError::transport("Error on socket write: connection task stopped"))?;
        Ok(bytes.len())
    }

    fn observe(&mut self, event: &TransportEvent) -> bool {
        let current = self.tracker.observe(event);
        if current && event.kind == TransportEventKind::Disconnected {
            self.outgoing = None;
            self.task = None;
        }
        current
    }
}

impl<C: Connector> Drop for StreamTransport<C> {
    fn drop(&mut self) {
        self.stop_task();
    }
}

async fn run_connection<C: Connector>(
    connector: Arc<C>,
    epoch: u64,
    events: TransportEventSender,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let send = |kind| {
        let _ = events.send(TransportEvent::new(epoch, kind));
    };

    let stream = match connector.open().await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Connect to {} failed: {}", connector.describe(), e);
            send(TransportEventKind::Error(e.to_string()));
            return;
        }
    };
    send(TransportEventKind::Connected);

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; ClientConfig::READ_CHUNK_SIZE];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("{} closed the connection", connector.describe());
                    break;
                }
                Ok(n) => send(TransportEventKind::Data(Bytes::copy_from_slice(&buf[..n]))),
                Err(e) => {
                    warn!("Error on socket read: {}", e);
                    send(TransportEventKind::Error(format!("Error on socket read: {}", e)));
                    break;
                }
            },
            message = outgoing.recv() => match message {
                Some(bytes) => {
                    let written = async {
                        writer.write_all(&bytes).await?;
                        writer.flush().await
                    }
                    .await;
                    if let Err(e) = written {
                        warn!("Error on socket write: {}", e);
                        send(TransportEventKind::Error(format!("Error on socket write: {}", e)));
                        break;
                    }
                }
                None => {
                    let _ = writer.shutdown().await;
                    break;
                }
            },
        }
    }

    send(TransportEventKind::Disconnected);
}

/// Connects to the node's local IPC endpoint: a Unix domain socket, or a
/// named pipe on Windows.
#[derive(Debug, Clone)]
pub struct LocalSocketConnector {
    path: PathBuf,
}

impl LocalSocketConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(unix)]
#[async_trait]
impl Connector for LocalSocketConnector {
    type Stream = tokio::net::UnixStream;

    async fn open(&self) -> std::io::Result<Self::Stream> {
        tokio::net::UnixStream::connect(&self.path).await
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(windows)]
#[async_trait]
impl Connector for LocalSocketConnector {
    type Stream = tokio::net::windows::named_pipe::NamedPipeClient;

    async fn open(&self) -> std::io::Result<Self::Stream> {
        tokio::net::windows::named_pipe::ClientOptions::new().open(&self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Connects to a node exposing the same stream protocol over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = tokio::net::TcpStream;

    async fn open(&self) -> std::io::Result<Self::Stream> {
        let stream = tokio::net::TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

pub type LocalSocketTransport = StreamTransport<LocalSocketConnector>;
pub type TcpTransport = StreamTransport<TcpConnector>;

impl StreamTransport<LocalSocketConnector> {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::new(LocalSocketConnector::new(path))
    }
}

impl StreamTransport<TcpConnector> {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::new(TcpConnector::new(addr))
    }
}
