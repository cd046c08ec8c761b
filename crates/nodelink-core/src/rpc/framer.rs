//! Splits the node's undelimited reply stream into whole JSON objects.
//!
//! The node writes replies back to back with no length prefix or newline
//! guarantee. Boundaries are found by a bracket scanner that tracks string
//! and escape state, so braces inside string values never confuse the
//! framer. Scan state survives between chunks and each byte is looked at
//! once. A candidate object is then checked with `serde_json` before it is
//! handed out.
//!
//! Usage follows a decoder: [`MessageFramer::extend`] with each chunk, then
//! call [`MessageFramer::next_frame`] until it returns `Ok(None)`.

use crate::config::ClientConfig;
use crate::error::{NodeError, Result};
use bytes::{Buf, Bytes, BytesMut};
use serde::de::IgnoredAny;

/// Accumulates transport bytes and yields complete JSON objects.
#[derive(Debug)]
pub struct MessageFramer {
    buffer: BytesMut,
    max_frame: usize,
    scan: ScanState,
}

/// Progress through the object at the front of the buffer.
#[derive(Debug, Default, Clone, Copy)]
struct ScanState {
    /// Bytes of the buffer already scanned.
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::with_max_frame(ClientConfig::MAX_FRAME_SIZE)
    }

    /// Create a framer that rejects messages larger than `max_frame` bytes.
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(ClientConfig::READ_CHUNK_SIZE),
            max_frame,
            scan: ScanState::default(),
        }
    }

    /// Append a chunk read from the transport.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Take the next complete message, if the buffer holds one.
    ///
    /// A partial trailing message stays buffered for the next chunk. Data
    /// that cannot start or continue a JSON object is a protocol error; the
    /// buffer is discarded since the stream position is lost. Messages
    /// returned before the error are unaffected.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.scan.pos == 0 {
            let leading = self
                .buffer
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            self.buffer.advance(leading);

            if self.buffer.is_empty() {
                return Ok(None);
            }
            if self.buffer[0] != b'{' {
                let preview = String::from_utf8_lossy(&self.buffer[..self.buffer.len().min(32)])
                    .into_owned();
                self.clear();
                return Err(NodeError::protocol(format!(
                    "Response is not a JSON object: {}",
                    preview
                )));
            }
        }

        let Some(end) = self.scan_to_close() else {
            if self.buffer.len() > self.max_frame {
                let size = self.buffer.len();
                self.clear();
                return Err(NodeError::protocol(format!(
                    "Response size {} exceeds maximum {}",
                    size, self.max_frame
                )));
            }
            return Ok(None);
        };

        self.scan = ScanState::default();
        let frame = self.buffer.split_to(end).freeze();
        if let Err(e) = serde_json::from_slice::<IgnoredAny>(&frame) {
            self.clear();
            return Err(NodeError::protocol(format!("Response parse error: {}", e)));
        }
        Ok(Some(frame))
    }

    /// Append `chunk` and collect every message it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>> {
        self.extend(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Continue scanning where the last call stopped. Returns the end offset
    /// of the front object once its outermost bracket closes.
    fn scan_to_close(&mut self) -> Option<usize> {
        let scan = &mut self.scan;
        for (offset, &byte) in self.buffer[scan.pos..].iter().enumerate() {
            if scan.in_string {
                if scan.escaped {
                    scan.escaped = false;
                } else if byte == b'\\' {
                    scan.escaped = true;
                } else if byte == b'"' {
                    scan.in_string = false;
                }
                continue;
            }
            match byte {
                b'"' => scan.in_string = true,
                b'{' | b'[' => scan.depth += 1,
                b'}' | b']' => {
                    scan.depth = scan.depth.saturating_sub(1);
                    if scan.depth == 0 {
                        return Some(scan.pos + offset + 1);
                    }
                }
                _ => {}
            }
        }
        scan.pos = self.buffer.len();
        None
    }

    /// Bytes buffered towards an incomplete message.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial message, e.g. after the connection is lost.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scan = ScanState::default();
    }
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new()
    }
}
