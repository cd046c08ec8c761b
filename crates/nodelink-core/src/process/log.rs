//! Capture of the node's standard output and error.

use crate::config::ClientConfig;
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Receives node output one line at a time.
pub trait LogSink: Send + Sync {
    fn append(&self, line: &str);
}

/// A captured line with the time it was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: DateTime<Local>,
    pub text: String,
}

/// Bounded in-memory node log, newest line first.
#[derive(Debug)]
pub struct NodeLog {
    lines: Mutex<VecDeque<LogLine>>,
    capacity: usize,
}

impl NodeLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Snapshot of the captured lines, newest first.
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// The captured lines joined newest first, as shown in a log view.
    pub fn contents(&self) -> String {
        self.lines()
            .iter()
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Default for NodeLog {
    fn default() -> Self {
        Self::new(ClientConfig::NODE_LOG_CAPACITY)
    }
}

impl LogSink for NodeLog {
    fn append(&self, line: &str) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.push_front(LogLine {
            timestamp: Local::now(),
            text: line.to_string(),
        });
        lines.truncate(self.capacity);
    }
}

/// Forwards node output to `tracing` under the `node` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn append(&self, line: &str) {
        info!(target: "node", "{}", line);
    }
}
