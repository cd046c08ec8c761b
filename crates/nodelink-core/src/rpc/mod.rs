//! JSON-RPC plumbing: wire types, stream framing, request bookkeeping and
//! reply validation.
//!
//! Nothing in here knows about sockets; bytes go out through a
//! [`Transport`](crate::transport::Transport) and come back in through the
//! [`MessageFramer`].

pub mod framer;
pub mod protocol;
pub mod queue;
pub mod request;
pub mod router;

pub use framer::MessageFramer;
pub use protocol::{RpcErrorObject, RpcRequest, RpcResponse};
pub use queue::{ActiveRequest, Dispatcher, Submitted};
pub use request::{FailurePolicy, Request, RequestKind, Visibility};
pub use router::read_reply;
