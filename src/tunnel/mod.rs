//! SSH tunnel process control
//!
//! This module owns the lifecycle of the `ssh -D` subprocess that provides the
//! shared SOCKS proxy, plus the readiness probe used to find out when the
//! proxy port starts accepting connections.

use async_trait::async_trait;
use std::io;
use std::process::{Command, ExitStatus};
use thiserror::Error;
use tokio::process::Child;
use tracing::{debug, warn};

pub mod mock;
mod probe;
mod ssh;

pub use probe::{wait_until_ready, ReadinessPolicy, ReadinessProbe, TcpProbe};
pub use ssh::SshTunnel;

/// Error types for tunnel operations
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Tunnel binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Failed to spawn tunnel process: {0}")]
    SpawnFailed(#[source] io::Error),

    #[error("Failed to signal tunnel process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },

    #[error("Failed to reap tunnel process: {0}")]
    WaitFailed(#[source] io::Error),

    #[error("Tunnel not reachable after {attempts} attempts")]
    NotReady { attempts: u32 },
}

impl TunnelError {
    /// Whether the daemon must stop after this error
    ///
    /// Anything except a readiness timeout means the process table no longer
    /// matches the daemon state.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TunnelError::NotReady { .. })
    }
}

/// Result type for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Where the tunnel goes and where it listens locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEndpoint {
    /// SSH server to connect to
    pub remote_host: String,
    /// SSH server port
    pub remote_port: u16,
    /// Local SOCKS port opened by `ssh -D`
    pub proxy_port: u16,
}

impl TunnelEndpoint {
    pub fn new(remote_host: impl Into<String>, remote_port: u16, proxy_port: u16) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port,
            proxy_port,
        }
    }
}

impl std::fmt::Display for TunnelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} (SOCKS on port {})",
            self.remote_host, self.remote_port, self.proxy_port
        )
    }
}

/// Handle to a running tunnel subprocess
///
/// When dropped, the tunnel subprocess is killed.
pub struct TunnelHandle {
    /// The subprocess running the tunnel
    process: Option<Child>,
    /// Name of the controller that started it (for logging)
    controller_name: String,
}

impl TunnelHandle {
    /// Create a new tunnel handle
    pub fn new(process: Child, controller_name: &str) -> Self {
        Self {
            process: Some(process),
            controller_name: controller_name.to_string(),
        }
    }

    /// Create a handle that is not backed by a subprocess
    ///
    /// Such a handle always reports itself as running.
    pub fn detached(controller_name: &str) -> Self {
        Self {
            process: None,
            controller_name: controller_name.to_string(),
        }
    }

    /// Process id of the subprocess, if it has not been reaped yet
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.id())
    }

    /// Check if the tunnel process is still running
    pub fn is_running(&mut self) -> bool {
        match self.process {
            Some(ref mut process) => matches!(process.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Send SIGTERM to the subprocess and wait for it to exit
    ///
    /// A process that already exited on its own is reaped without signalling.
    pub async fn terminate(&mut self) -> TunnelResult<Option<ExitStatus>> {
        let Some(mut process) = self.process.take() else {
            return Ok(None);
        };

        if let Some(status) = process.try_wait().map_err(TunnelError::WaitFailed)? {
            warn!(
                "{} process had already exited ({})",
                self.controller_name, status
            );
            return Ok(Some(status));
        }

        let Some(pid) = process.id() else {
            return Ok(None);
        };
        send_terminate(&mut process, pid)?;

        let status = process.wait().await.map_err(TunnelError::WaitFailed)?;
        debug!(
            "{} process {} exited ({})",
            self.controller_name, pid, status
        );
        Ok(Some(status))
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        if let Some(ref mut process) = self.process.take() {
            let _ = process.start_kill();
        }
    }
}

#[cfg(unix)]
fn send_terminate(_process: &mut Child, pid: u32) -> TunnelResult<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw_pid = i32::try_from(pid).map_err(|_| TunnelError::SignalFailed {
        pid,
        reason: "pid out of range".to_string(),
    })?;
    kill(Pid::from_raw(raw_pid), Signal::SIGTERM).map_err(|errno| TunnelError::SignalFailed {
        pid,
        reason: errno.to_string(),
    })
}

#[cfg(not(unix))]
fn send_terminate(process: &mut Child, pid: u32) -> TunnelResult<()> {
    process.start_kill().map_err(|e| TunnelError::SignalFailed {
        pid,
        reason: e.to_string(),
    })
}

/// Starts and stops the tunnel subprocess
///
/// The daemon holds exactly one controller and calls `start` on the first
/// client and `stop` when the last client leaves.
#[async_trait]
pub trait TunnelController: Send + Sync {
    /// Get the name of this controller
    fn name(&self) -> &'static str;

    /// Check if this controller can run on this system (binary installed)
    fn is_available(&self) -> bool {
        true
    }

    /// Launch the tunnel subprocess
    async fn start(&self, endpoint: &TunnelEndpoint) -> TunnelResult<TunnelHandle>;

    /// Terminate the tunnel subprocess and reap it
    async fn stop(&self, handle: TunnelHandle) -> TunnelResult<()>;
}

/// Check if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}
