//! Spawning and terminating the node process.
//!
//! Termination is polled rather than awaited: the first
//! [`NodeSupervisor::poll_terminate`] asks the process to stop, later calls
//! check on it, and once the grace period has passed a forced kill is sent.
//! The caller keeps polling until the process is confirmed gone.

use super::log::LogSink;
use crate::config::ClientConfig;
use crate::error::{NodeError, Result};
use crate::platform;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for launching the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLaunchConfig {
    /// Path to the node binary.
    pub binary_path: PathBuf,
    /// Extra flags, passed first.
    pub extra_args: Vec<String>,
    /// Passed as `--datadir`.
    pub data_dir: Option<PathBuf>,
    /// Appends `--testnet`.
    pub testnet: bool,
}

impl NodeLaunchConfig {
    pub fn new(binary_path: impl AsRef<Path>) -> Self {
        Self {
            binary_path: binary_path.as_ref().to_path_buf(),
            extra_args: Vec::new(),
            data_dir: None,
            testnet: false,
        }
    }

    /// Set extra arguments.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Add an extra argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn with_data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.data_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_testnet(mut self, testnet: bool) -> Self {
        self.testnet = testnet;
        self
    }

    /// Full argument list: extra flags, data directory, network selector.
    pub fn args(&self) -> Vec<String> {
        let mut args = self.extra_args.clone();
        if let Some(dir) = &self.data_dir {
            args.push("--datadir".to_string());
            args.push(dir.display().to_string());
        }
        if self.testnet {
            args.push("--testnet".to_string());
        }
        args
    }

    /// Check that the binary exists and is executable.
    pub fn validate(&self) -> Result<()> {
        if !self.binary_path.exists() || !platform::is_executable(&self.binary_path) {
            return Err(NodeError::Process {
                message: format!(
                    "Could not find the node at {}. Please check the node path and try again.",
                    self.binary_path.display()
                ),
                path: Some(self.binary_path.clone()),
            });
        }
        Ok(())
    }
}

/// Lifecycle notifications from the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    Started { pid: Option<u32> },
}

/// Result of one [`NodeSupervisor::poll_terminate`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// No process was running.
    AlreadyStopped,
    /// The process exited after being asked to; `forced` if it took a kill.
    Stopped { forced: bool },
    /// Still running; poll again.
    Pending,
}

/// The operations the supervisor needs from a running child.
pub trait ChildProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Non-blocking exit check.
    fn has_exited(&mut self) -> std::io::Result<bool>;

    /// Ask the process to shut down cleanly.
    fn request_stop(&mut self) -> std::io::Result<()>;

    /// Kill the process outright.
    fn kill(&mut self) -> std::io::Result<()>;
}

impl ChildProcess for tokio::process::Child {
    fn id(&self) -> Option<u32> {
        tokio::process::Child::id(self)
    }

    fn has_exited(&mut self) -> std::io::Result<bool> {
        self.try_wait().map(|status| status.is_some())
    }

    fn request_stop(&mut self) -> std::io::Result<()> {
        match tokio::process::Child::id(self) {
            Some(pid) => match platform::request_graceful_stop(pid) {
                Ok(_) => Ok(()),
                Err(e) => {
                    debug!("Graceful stop unavailable ({}), killing", e);
                    self.start_kill()
                }
            },
            None => Ok(()),
        }
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.start_kill()
    }
}

/// Owns the spawned node process, if any.
pub struct NodeSupervisor {
    child: Option<Box<dyn ChildProcess>>,
    grace_period: Duration,
    stop_requested_at: Option<Instant>,
    killed: bool,
}

impl NodeSupervisor {
    pub fn new() -> Self {
        Self {
            child: None,
            grace_period: ClientConfig::KILL_GRACE_PERIOD,
            stop_requested_at: None,
            killed: false,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Launch the node, piping its output lines into `sink`.
    ///
    /// Sends [`ProcessEvent::Started`] on success.
    pub fn spawn(
        &mut self,
        config: &NodeLaunchConfig,
        sink: Arc<dyn LogSink>,
        events: &mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<Option<u32>> {
        if self.is_running() {
            return Err(NodeError::Process {
                message: "Node process already running".to_string(),
                path: Some(config.binary_path.clone()),
            });
        }
        if self.child.take().is_some() {
            debug!("Previous node process has exited");
        }
        config.validate()?;

        let args = config.args();
        info!("Node starting {} {}", config.binary_path.display(), args.join(" "));

        let mut child = tokio::process::Command::new(&config.binary_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| NodeError::Process {
                message: format!("Failed to start the node: {}", e),
                path: Some(config.binary_path.clone()),
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, Arc::clone(&sink)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, sink));
        }

        let pid = child.id();
        debug!("Node process started with PID {:?}", pid);
        self.adopt(Box::new(child));
        let _ = events.send(ProcessEvent::Started { pid });
        Ok(pid)
    }

    /// Take ownership of an already running child.
    pub fn adopt(&mut self, child: Box<dyn ChildProcess>) {
        self.child = Some(child);
        self.stop_requested_at = None;
        self.killed = false;
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.id())
    }

    /// True while an owned child has not exited.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => !child.has_exited().unwrap_or(true),
            None => false,
        }
    }

    /// Advance termination of the owned process by one step.
    pub fn poll_terminate(&mut self) -> Termination {
        let Some(child) = self.child.as_mut() else {
            return Termination::AlreadyStopped;
        };

        let exited = child.has_exited().unwrap_or_else(|e| {
            warn!("Could not query node process state: {}", e);
            true
        });
        if exited {
            self.child = None;
            return match self.stop_requested_at.take() {
                Some(_) => {
                    info!("Node process exited");
                    Termination::Stopped {
                        forced: std::mem::take(&mut self.killed),
                    }
                }
                None => Termination::AlreadyStopped,
            };
        }

        match self.stop_requested_at {
            None => {
                if let Err(e) = child.request_stop() {
                    warn!("Failed to ask the node to stop: {}", e);
                }
                self.stop_requested_at = Some(Instant::now());
            }
            Some(requested) if !self.killed && requested.elapsed() >= self.grace_period => {
                warn!(
                    "Node did not exit in {} seconds. Killing...",
                    self.grace_period.as_secs()
                );
                if let Err(e) = child.kill() {
                    warn!("Failed to kill the node: {}", e);
                }
                self.killed = true;
            }
            Some(_) => {}
        }
        Termination::Pending
    }
}

impl Default for NodeSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

async fn forward_lines<R>(reader: R, sink: Arc<dyn LogSink>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => sink.append(&line),
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading node output: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::NodeLog;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct FakeChild {
        exited: Arc<AtomicBool>,
        exit_on_stop: bool,
        stops: Arc<AtomicUsize>,
        kills: Arc<AtomicUsize>,
    }

    impl ChildProcess for FakeChild {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        fn has_exited(&mut self) -> std::io::Result<bool> {
            Ok(self.exited.load(Ordering::SeqCst))
        }

        fn request_stop(&mut self) -> std::io::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.exit_on_stop {
                self.exited.store(true, Ordering::SeqCst);
            }
            Ok(())
        }

        fn kill(&mut self) -> std::io::Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_launch_args() {
        let config = NodeLaunchConfig::new("/usr/bin/gdbix")
            .with_arg("--fast")
            .with_data_dir("/data")
            .with_testnet(true);
        assert_eq!(config.args(), vec!["--fast", "--datadir", "/data", "--testnet"]);

        let plain = NodeLaunchConfig::new("/usr/bin/gdbix");
        assert!(plain.args().is_empty());
    }

    #[test]
    fn test_validate_missing_binary() {
        let temp_dir = TempDir::new().unwrap();
        let config = NodeLaunchConfig::new(temp_dir.path().join("gdbix"));
        match config.validate() {
            Err(NodeError::Process { path, .. }) => {
                assert_eq!(path, Some(temp_dir.path().join("gdbix")));
            }
            other => panic!("expected process error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_non_executable_binary() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gdbix");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        assert!(NodeLaunchConfig::new(&path).validate().is_err());
    }

    #[test]
    fn test_nothing_to_terminate() {
        let mut supervisor = NodeSupervisor::new();
        assert_eq!(supervisor.poll_terminate(), Termination::AlreadyStopped);
        assert!(!supervisor.is_running());
    }

    #[test]
    fn test_crashed_process_is_already_stopped() {
        let mut supervisor = NodeSupervisor::new();
        let child = FakeChild::default();
        child.exited.store(true, Ordering::SeqCst);
        supervisor.adopt(Box::new(child.clone()));

        assert_eq!(supervisor.poll_terminate(), Termination::AlreadyStopped);
        assert_eq!(child.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop() {
        let mut supervisor = NodeSupervisor::new();
        let child = FakeChild {
            exit_on_stop: true,
            ..FakeChild::default()
        };
        supervisor.adopt(Box::new(child.clone()));

        assert_eq!(supervisor.poll_terminate(), Termination::Pending);
        assert_eq!(
            supervisor.poll_terminate(),
            Termination::Stopped { forced: false }
        );
        assert_eq!(child.stops.load(Ordering::SeqCst), 1);
        assert_eq!(child.kills.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.poll_terminate(), Termination::AlreadyStopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_escalation_happens_once() {
        let mut supervisor = NodeSupervisor::new();
        let child = FakeChild::default();
        supervisor.adopt(Box::new(child.clone()));

        assert_eq!(supervisor.poll_terminate(), Termination::Pending);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(supervisor.poll_terminate(), Termination::Pending);
        assert_eq!(child.kills.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(supervisor.poll_terminate(), Termination::Pending);
        assert_eq!(child.kills.load(Ordering::SeqCst), 1);

        // Still running after the kill: keep reporting pending, no second kill.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(supervisor.poll_terminate(), Termination::Pending);
        assert_eq!(child.kills.load(Ordering::SeqCst), 1);
        assert_eq!(child.stops.load(Ordering::SeqCst), 1);

        child.exited.store(true, Ordering::SeqCst);
        assert_eq!(
            supervisor.poll_terminate(),
            Termination::Stopped { forced: true }
        );
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_sends_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = NodeSupervisor::new();

        let result = supervisor.spawn(
            &NodeLaunchConfig::new(temp_dir.path().join("gdbix")),
            Arc::new(NodeLog::default()),
            &tx,
        );
        assert!(matches!(result, Err(NodeError::Process { .. })));
        assert!(rx.try_recv().is_err());
        assert_eq!(supervisor.pid(), None);
    }

    #[tokio::test]
    async fn test_spawn_refused_while_child_running() {
        let temp_dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = NodeSupervisor::new();
        supervisor.adopt(Box::new(FakeChild::default()));

        let result = supervisor.spawn(
            &NodeLaunchConfig::new(temp_dir.path().join("gdbix")),
            Arc::new(NodeLog::default()),
            &tx,
        );
        match result {
            Err(NodeError::Process { message, .. }) => assert!(message.contains("already running")),
            other => panic!("expected process error, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(supervisor.pid(), Some(4242));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_respawn_after_child_exited() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("gdbix");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let crashed = FakeChild::default();
        crashed.exited.store(true, Ordering::SeqCst);
        let mut supervisor = NodeSupervisor::new();
        supervisor.adopt(Box::new(crashed));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let pid = supervisor
            .spawn(&NodeLaunchConfig::new(&script), Arc::new(NodeLog::default()), &tx)
            .unwrap();
        assert!(pid.is_some());
        assert_ne!(pid, Some(4242));
        assert_eq!(rx.recv().await, Some(ProcessEvent::Started { pid }));
        assert!(supervisor.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_captures_output_and_terminates() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("gdbix");
        std::fs::write(&script, "#!/bin/sh\necho \"started $*\"\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let log = Arc::new(NodeLog::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = NodeSupervisor::new();
        let config = NodeLaunchConfig::new(&script).with_data_dir("/tmp/dd");

        let pid = supervisor.spawn(&config, log.clone(), &tx).unwrap();
        assert!(pid.is_some());
        assert_eq!(rx.recv().await, Some(ProcessEvent::Started { pid }));
        assert!(supervisor.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while log.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(log.lines()[0].text, "started --datadir /tmp/dd");

        let mut outcome = supervisor.poll_terminate();
        while outcome == Termination::Pending && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
            outcome = supervisor.poll_terminate();
        }
        assert_eq!(outcome, Termination::Stopped { forced: false });
    }
}
