//! Daemon server owning the shared SSH tunnel
//!
//! The daemon listens on a TCP control port and hands each connection to the
//! arbiter, one at a time. It runs until a shutdown is requested through a
//! `DaemonHandle` or SIGTERM/SIGINT arrives, and always stops the tunnel
//! before returning.

use crate::daemon::arbiter::Arbiter;
use crate::tunnel::{ReadinessPolicy, TunnelEndpoint, TunnelError};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{lookup_host, TcpListener};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Default local port for the SOCKS proxy
pub const DEFAULT_PROXY_PORT: u16 = 1080;

/// Default control port
pub const DEFAULT_CONTROL_PORT: u16 = 1081;

/// Default remote SSH port
pub const DEFAULT_REMOTE_PORT: u16 = 22;

/// Control address used when only local clients are accepted
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Control address used when remote clients are accepted
pub const ANY_HOST: &str = "0.0.0.0";

/// Errors that can occur in the daemon server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Error looking up address {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Error binding to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Could not install signal handler: {0}")]
    Signal(#[source] io::Error),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

/// Settings fixed for the lifetime of the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Tunnel destination and local SOCKS port
    pub endpoint: TunnelEndpoint,
    /// Port for control connections
    pub control_port: u16,
    /// Explicit control bind address, overriding `accept_remote`
    pub bind_host: Option<String>,
    /// Accept control connections from other machines
    pub accept_remote: bool,
    /// Readiness polling after a tunnel start
    pub readiness: ReadinessPolicy,
}

impl DaemonConfig {
    /// Create a config with default ports for the given SSH host
    pub fn new(remote_host: impl Into<String>) -> Self {
        Self {
            endpoint: TunnelEndpoint::new(remote_host, DEFAULT_REMOTE_PORT, DEFAULT_PROXY_PORT),
            control_port: DEFAULT_CONTROL_PORT,
            bind_host: None,
            accept_remote: false,
            readiness: ReadinessPolicy::default(),
        }
    }

    /// Address the control listener binds to
    pub fn control_host(&self) -> &str {
        match self.bind_host {
            Some(ref host) => host,
            None if self.accept_remote => ANY_HOST,
            None => LOOPBACK_HOST,
        }
    }
}

/// Handle to control a running daemon server
#[derive(Clone)]
pub struct DaemonHandle {
    shutdown_tx: broadcast::Sender<()>,
}

impl DaemonHandle {
    /// Signal the daemon to shut down gracefully
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Daemon server state
pub struct DaemonServer {
    listener: TcpListener,
    arbiter: Arbiter,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl DaemonServer {
    /// Resolve and bind the control address
    ///
    /// Every resolved address is tried in turn; the first one that binds wins.
    pub async fn bind(config: &DaemonConfig, arbiter: Arbiter) -> Result<Self, ServerError> {
        let host = config.control_host();
        let display = format!("{}:{}", host, config.control_port);

        let addrs: Vec<SocketAddr> = lookup_host((host, config.control_port))
            .await
            .map_err(|source| ServerError::Resolve {
                addr: display.clone(),
                source,
            })?
            .collect();

        let mut last_error = io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses");
        let mut bound = None;
        for addr in addrs {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    bound = Some(listener);
                    break;
                }
                Err(e) => {
                    debug!("Could not bind {}: {}", addr, e);
                    last_error = e;
                }
            }
        }

        let listener = bound.ok_or(ServerError::Bind {
            addr: display,
            source: last_error,
        })?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Ok(Self {
            listener,
            arbiter,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Address the control listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Get a handle that can stop the daemon
    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Run the accept loop until shutdown
    ///
    /// Each connection is read, applied and answered before the next one is
    /// accepted. Per-connection problems are logged; fatal tunnel errors end
    /// the loop and are returned after cleanup.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let mut signals = ShutdownSignals::install()?;
        let addr = self.local_addr()?;
        info!(
            "tunneld: Started. Listening on {} for {}",
            addr,
            self.arbiter.endpoint()
        );

        let result = loop {
            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("Error while accepting connection: {}. Continuing.", e);
                        continue;
                    }
                },
                _ = self.shutdown_rx.recv() => {
                    info!("Received shutdown request, stopping daemon");
                    break Ok(());
                }
                name = signals.recv() => {
                    info!("Received {}. Stopping.", name);
                    break Ok(());
                }
            };

            let peer = peer.to_string();
            debug!("Accepted connection from {}", peer);

            tokio::select! {
                handled = self.arbiter.handle_connection(stream, &peer) => {
                    if let Err(e) = handled {
                        error!("Fatal tunnel error: {}. Exiting.", e);
                        break Err(ServerError::Tunnel(e));
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Received shutdown request while serving {}, stopping daemon", peer);
                    break Ok(());
                }
                name = signals.recv() => {
                    info!("Received {} while serving {}. Stopping.", name, peer);
                    break Ok(());
                }
            }
        };

        if let Err(e) = self.arbiter.shutdown().await {
            warn!("Failed to stop tunnel during shutdown: {}", e);
            if result.is_ok() {
                return Err(e.into());
            }
        }

        info!("Daemon stopped");
        result
    }
}

/// OS signals that stop the daemon
struct ShutdownSignals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    #[cfg(unix)]
    fn install() -> Result<Self, ServerError> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            terminate: signal(SignalKind::terminate()).map_err(ServerError::Signal)?,
            interrupt: signal(SignalKind::interrupt()).map_err(ServerError::Signal)?,
        })
    }

    #[cfg(not(unix))]
    fn install() -> Result<Self, ServerError> {
        Ok(Self {})
    }

    /// Wait for the next shutdown signal and return its name
    #[cfg(unix)]
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> &'static str {
        let _ = tokio::signal::ctrl_c().await;
        "Ctrl+C"
    }
}
