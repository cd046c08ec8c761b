//! Filter id bookkeeping.
//!
//! The node keeps block and event filters server side and hands back an id.
//! Each kind has one slot that moves through
//! `Empty -> Installing -> Installed(id) -> Uninstalling(id) -> Empty`.
//! Only installed ids are polled. Installs requested while an uninstall of
//! the same kind is in flight are parked until the uninstall is
//! acknowledged.

use crate::error::{NodeError, Result};
use crate::units;
use serde_json::{json, Map, Value};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    Block,
    Event,
}

impl FilterKind {
    fn label(self) -> &'static str {
        match self {
            FilterKind::Block => "Block",
            FilterKind::Event => "Event",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum FilterSlot {
    #[default]
    Empty,
    Installing,
    Installed(String),
    Uninstalling(String),
}

/// Addresses and topics of an event filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilterSpec {
    pub addresses: Vec<String>,
    pub topics: Vec<String>,
}

impl EventFilterSpec {
    pub fn new(addresses: Vec<String>, topics: Vec<String>) -> Self {
        Self { addresses, topics }
    }

    /// Nothing to watch without an address.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    fn criteria(&self) -> Map<String, Value> {
        let mut object = Map::new();
        object.insert("address".into(), json!(self.addresses));
        if self.topics.first().is_some_and(|topic| !topic.is_empty()) {
            object.insert("topics".into(), json!(self.topics));
        }
        object
    }

    /// Params for `eth_newFilter`.
    pub fn filter_params(&self) -> Vec<Value> {
        vec![Value::Object(self.criteria())]
    }

    /// Params for `eth_getLogs` starting at `from_block`; 0 means latest.
    pub fn logs_params(&self, from_block: u64) -> Vec<Value> {
        let mut object = self.criteria();
        let from = if from_block == 0 {
            "latest".to_string()
        } else {
            units::to_hex(u128::from(from_block))
        };
        object.insert("fromBlock".into(), Value::String(from));
        vec![Value::Object(object)]
    }
}

#[derive(Debug, Default)]
pub struct FilterManager {
    block: FilterSlot,
    event: FilterSlot,
    deferred_event: Option<EventFilterSpec>,
    block_reinstall: bool,
}

impl FilterManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: FilterKind) -> &FilterSlot {
        match kind {
            FilterKind::Block => &self.block,
            FilterKind::Event => &self.event,
        }
    }

    fn slot_mut(&mut self, kind: FilterKind) -> &mut FilterSlot {
        match kind {
            FilterKind::Block => &mut self.block,
            FilterKind::Event => &mut self.event,
        }
    }

    /// Claim the slot for an install. Refused unless the slot is empty.
    pub fn begin_install(&mut self, kind: FilterKind) -> Result<()> {
        let slot = self.slot_mut(kind);
        if *slot != FilterSlot::Empty {
            return Err(NodeError::protocol("Filter already set"));
        }
        *slot = FilterSlot::Installing;
        Ok(())
    }

    /// Record the id the node assigned.
    pub fn install_succeeded(&mut self, kind: FilterKind, id: &str) -> Result<()> {
        let slot = self.slot_mut(kind);
        if id.is_empty() {
            *slot = FilterSlot::Empty;
            return Err(NodeError::validation(
                "filter",
                format!("{} filter ID invalid", kind.label()),
            ));
        }
        debug!("{} filter installed: {}", kind.label(), id);
        *slot = FilterSlot::Installed(id.to_string());
        Ok(())
    }

    pub fn install_failed(&mut self, kind: FilterKind) {
        let slot = self.slot_mut(kind);
        if *slot == FilterSlot::Installing {
            *slot = FilterSlot::Empty;
        }
    }

    /// Mark an installed filter as being removed and return its id.
    pub fn begin_uninstall(&mut self, kind: FilterKind) -> Option<String> {
        let slot = self.slot_mut(kind);
        match std::mem::take(slot) {
            FilterSlot::Installed(id) => {
                *slot = FilterSlot::Uninstalling(id.clone());
                Some(id)
            }
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Clear the slot whose uninstall of `id` completed.
    pub fn uninstall_finished(&mut self, id: &str) -> Option<FilterKind> {
        for kind in [FilterKind::Block, FilterKind::Event] {
            let slot = self.slot_mut(kind);
            let matches = match &*slot {
                FilterSlot::Uninstalling(current) | FilterSlot::Installed(current) => current == id,
                _ => false,
            };
            if matches {
                *slot = FilterSlot::Empty;
                debug!("{} filter uninstalled: {}", kind.label(), id);
                return Some(kind);
            }
        }
        None
    }

    /// Id to poll, only while installed.
    pub fn id(&self, kind: FilterKind) -> Option<&str> {
        match self.slot(kind) {
            FilterSlot::Installed(id) => Some(id),
            _ => None,
        }
    }

    /// Id known to the node, installed or being removed.
    pub fn tracked_id(&self, kind: FilterKind) -> Option<&str> {
        match self.slot(kind) {
            FilterSlot::Installed(id) | FilterSlot::Uninstalling(id) => Some(id),
            _ => None,
        }
    }

    /// Kind of the installed filter with this id.
    pub fn kind_of(&self, id: &str) -> Option<FilterKind> {
        [FilterKind::Block, FilterKind::Event]
            .into_iter()
            .find(|kind| self.id(*kind) == Some(id))
    }

    /// True unless the slot is empty.
    pub fn is_tracked(&self, kind: FilterKind) -> bool {
        *self.slot(kind) != FilterSlot::Empty
    }

    pub fn is_uninstalling(&self, kind: FilterKind) -> bool {
        matches!(self.slot(kind), FilterSlot::Uninstalling(_))
    }

    pub fn has_uninstall_pending(&self) -> bool {
        self.is_uninstalling(FilterKind::Block) || self.is_uninstalling(FilterKind::Event)
    }

    /// Park an event filter install until the current one is gone.
    /// A later request replaces an earlier one.
    pub fn defer_event_install(&mut self, spec: EventFilterSpec) {
        self.deferred_event = Some(spec);
    }

    pub fn take_deferred_event(&mut self) -> Option<EventFilterSpec> {
        self.deferred_event.take()
    }

    pub fn request_block_reinstall(&mut self) {
        self.block_reinstall = true;
    }

    pub fn cancel_block_reinstall(&mut self) {
        self.block_reinstall = false;
    }

    pub fn take_block_reinstall(&mut self) -> bool {
        std::mem::take(&mut self.block_reinstall)
    }

    /// Roll back requests that will never be answered.
    ///
    /// Installs in flight are forgotten; uninstalls in flight fall back to
    /// installed, since the node still holds the filter.
    pub fn abandon_pending(&mut self) {
        for kind in [FilterKind::Block, FilterKind::Event] {
            let slot = self.slot_mut(kind);
            *slot = match std::mem::take(slot) {
                FilterSlot::Installing => FilterSlot::Empty,
                FilterSlot::Uninstalling(id) => FilterSlot::Installed(id),
                other => other,
            };
        }
        self.deferred_event = None;
        self.block_reinstall = false;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
