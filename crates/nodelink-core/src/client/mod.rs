//! The node client: connection state machine, filters, polling and the
//! event loop that drives them.

mod core;
mod events;
mod filters;
mod handle;
mod handlers;
mod state;

#[cfg(test)]
pub(crate) mod harness;

pub use self::core::{ClientCore, CoreChannels};
pub use events::NodeEvent;
pub use filters::{EventFilterSpec, FilterKind, FilterManager};
pub use handle::NodeClient;
pub use handlers::parse_node_version;
pub use state::{ClientState, ConnectionSnapshot, StartingStage};
