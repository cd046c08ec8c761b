//! Single-in-flight request dispatch.
//!
//! At most one request is outstanding on the transport. Anything submitted
//! while a request is active waits in a FIFO queue and is written when the
//! active one completes, successfully or not. Call ids come from a counter
//! owned by the dispatcher, so independent clients never share ids.

use super::request::{Request, RequestKind, Visibility};
use crate::error::{NodeError, Result};
use crate::transport::Transport;
use serde_json::Value;
use std::collections::VecDeque;
use tracing::debug;

/// The request currently awaiting a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ActiveRequest {
    None,
    /// Placeholder held while connecting or disconnecting. Counts as a
    /// user-visible operation but expects no reply.
    Reserved,
    InFlight(Request),
}

impl ActiveRequest {
    pub fn visibility(&self) -> Option<Visibility> {
        match self {
            ActiveRequest::None => None,
            ActiveRequest::Reserved => Some(Visibility::Full),
            ActiveRequest::InFlight(request) => Some(request.visibility()),
        }
    }
}

/// Outcome of [`Dispatcher::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Written(u64),
    Queued(u64),
}

#[derive(Debug)]
pub struct Dispatcher {
    next_id: u64,
    active: ActiveRequest,
    queue: VecDeque<Request>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            active: ActiveRequest::None,
            queue: VecDeque::new(),
        }
    }

    /// Build a request with the next call id.
    pub fn prepare(&mut self, kind: RequestKind, method: impl Into<String>, params: Vec<Value>) -> Request {
        let id = self.next_id;
        self.next_id += 1;
        Request::new(id, kind, method, params)
    }

    /// Write `request` now if nothing is active, otherwise queue it.
    ///
    /// A failed write leaves nothing active and nothing queued.
    pub fn submit(&mut self, request: Request, transport: &mut dyn Transport) -> Result<Submitted> {
        let id = request.call_id();
        if self.active == ActiveRequest::None {
            self.write(request, transport)?;
            Ok(Submitted::Written(id))
        } else {
            debug!("Queued: {}", request.log_line());
            self.queue.push_back(request);
            Ok(Submitted::Queued(id))
        }
    }

    /// Finish the active request and write the next queued one, if any.
    ///
    /// Returns the call id written.
    pub fn complete(&mut self, transport: &mut dyn Transport) -> Result<Option<u64>> {
        self.active = ActiveRequest::None;
        match self.queue.pop_front() {
            Some(next) => {
                let id = next.call_id();
                self.write(next, transport)?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    fn write(&mut self, request: Request, transport: &mut dyn Transport) -> Result<()> {
        if !transport.is_writable() {
            return Err(NodeError::transport("Socket not writeable"));
        }
        let bytes = request.encode()?;
        debug!("Sent: {}", request.log_line());
        self.active = ActiveRequest::InFlight(request);

        match transport.write(&bytes) {
            Ok(n) if n > 0 => Ok(()),
            Ok(_) => {
                self.active = ActiveRequest::None;
                Err(NodeError::transport("Error on socket write: nothing written"))
            }
            Err(e) => {
                self.active = ActiveRequest::None;
                Err(e)
            }
        }
    }

    /// Hold the active slot without a request, so submissions queue.
    pub fn reserve(&mut self) {
        if self.active == ActiveRequest::None {
            self.active = ActiveRequest::Reserved;
        }
    }

    /// Release a reservation without touching the queue.
    pub fn release(&mut self) {
        if self.active == ActiveRequest::Reserved {
            self.active = ActiveRequest::None;
        }
    }

    /// Drop the active request and everything queued.
    pub fn reset(&mut self) {
        if !self.queue.is_empty() {
            debug!("Discarding {} queued requests", self.queue.len());
        }
        self.active = ActiveRequest::None;
        self.queue.clear();
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    pub fn active(&self) -> &ActiveRequest {
        &self.active
    }

    pub fn active_request(&self) -> Option<&Request> {
        match &self.active {
            ActiveRequest::InFlight(request) => Some(request),
            _ => None,
        }
    }

    /// True while a user-visible operation is outstanding.
    pub fn is_busy(&self) -> bool {
        self.active.visibility() == Some(Visibility::Full)
    }

    pub fn has_active(&self) -> bool {
        self.active != ActiveRequest::None
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Call ids waiting in the queue, front first.
    pub fn queued_ids(&self) -> Vec<u64> {
        self.queue.iter().map(Request::call_id).collect()
    }

    /// True if an identical call is active or waiting.
    pub fn is_pending(&self, method: &str, params: &[Value]) -> bool {
        self.active_request()
            .into_iter()
            .chain(self.queue.iter())
            .any(|request| request.same_call(method, params))
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
