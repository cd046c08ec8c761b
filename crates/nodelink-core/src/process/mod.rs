//! Node process management: launching, output capture and termination.

pub mod log;
pub mod supervisor;

pub use log::{LogLine, LogSink, NodeLog, TracingLogSink};
pub use supervisor::{ChildProcess, NodeLaunchConfig, NodeSupervisor, ProcessEvent, Termination};
