//! Client-side relay through the shared SOCKS proxy
//!
//! After the daemon acknowledges a `Connect`, the client runs
//! `nc -X 5 -x <proxy_host>:<proxy_port> <host> <port>` with its own stdio so
//! it can serve as an ssh `ProxyCommand`. The relay runs until it exits or the
//! client is told to stop.

use std::io;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Relay binary used when none is configured
pub const DEFAULT_RELAY_COMMAND: &str = "nc";

/// Default host of the SOCKS proxy and the daemon
pub const DEFAULT_PROXY_HOST: &str = "127.0.0.1";

/// Errors from running the relay
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay binary '{0}' not found. Is netcat installed?")]
    BinaryNotFound(String),

    #[error("Failed to start relay: {0}")]
    SpawnFailed(#[source] io::Error),

    #[error("Failed to wait for relay: {0}")]
    WaitFailed(#[source] io::Error),

    #[error("Could not install signal handler: {0}")]
    Signal(#[source] io::Error),
}

#[cfg(unix)]
pub use nix::sys::signal::Signal;

/// No stop signals are handled off unix
#[cfg(not(unix))]
pub type Signal = std::convert::Infallible;

/// How the relay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The relay process exited on its own
    Finished(ExitStatus),
    /// The client received a stop signal
    Interrupted(Signal),
}

impl RelayExit {
    /// Process exit code the client should report
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayExit::Finished(status) => status.code().unwrap_or(1),
            #[cfg(unix)]
            RelayExit::Interrupted(signal) => 128 + *signal as i32,
            #[cfg(not(unix))]
            RelayExit::Interrupted(never) => match *never {},
        }
    }
}

/// A netcat invocation through a SOCKS5 proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCommand {
    pub program: String,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl RelayCommand {
    /// Relay to `target_host:target_port` through the proxy on `proxy_host:proxy_port`
    pub fn new(
        proxy_host: impl Into<String>,
        proxy_port: u16,
        target_host: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            program: DEFAULT_RELAY_COMMAND.to_string(),
            proxy_host: proxy_host.into(),
            proxy_port,
            target_host: target_host.into(),
            target_port,
        }
    }

    /// Use a different relay binary
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Build the argument list
    pub fn args(&self) -> Vec<String> {
        vec![
            "-X".to_string(),
            "5".to_string(),
            "-x".to_string(),
            format!("{}:{}", self.proxy_host, self.proxy_port),
            self.target_host.clone(),
            self.target_port.to_string(),
        ]
    }

    /// Start the relay with the client's stdio
    pub fn spawn(&self) -> Result<Child, RelayError> {
        let args = self.args();
        debug!("Running {} {}", self.program, args.join(" "));

        Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => RelayError::BinaryNotFound(self.program.clone()),
                _ => RelayError::SpawnFailed(e),
            })
    }

    /// Run the relay until it exits or a stop signal arrives
    pub async fn run(&self, signals: &mut StopSignals) -> Result<RelayExit, RelayError> {
        let child = self.spawn()?;
        supervise(child, signals.recv()).await
    }
}

/// Wait for `child`, killing it if `stop` resolves first
async fn supervise(
    mut child: Child,
    stop: impl std::future::Future<Output = Signal>,
) -> Result<RelayExit, RelayError> {
    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(RelayError::WaitFailed)?;
            debug!("Relay exited with {}", status);
            Ok(RelayExit::Finished(status))
        }
        signal = stop => {
            debug!("Received {}, stopping relay", signal);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill relay: {}", e);
            }
            Ok(RelayExit::Interrupted(signal))
        }
    }
}

/// OS signals that end the client
///
/// Installed before the tunnel is requested, so a signal that arrives while
/// the daemon is still bringing the tunnel up is caught rather than killing
/// the process.
pub struct StopSignals {
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl StopSignals {
    #[cfg(unix)]
    pub fn install() -> Result<Self, RelayError> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            hangup: signal(SignalKind::hangup()).map_err(RelayError::Signal)?,
            interrupt: signal(SignalKind::interrupt()).map_err(RelayError::Signal)?,
            terminate: signal(SignalKind::terminate()).map_err(RelayError::Signal)?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> Result<Self, RelayError> {
        Ok(Self {})
    }

    /// Wait for the next stop signal
    #[cfg(unix)]
    pub async fn recv(&mut self) -> Signal {
        tokio::select! {
            _ = self.hangup.recv() => Signal::SIGHUP,
            _ = self.interrupt.recv() => Signal::SIGINT,
            _ = self.terminate.recv() => Signal::SIGTERM,
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> Signal {
        std::future::pending().await
    }
}
