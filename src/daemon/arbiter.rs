//! Reference-counting arbiter for the shared tunnel
//!
//! The arbiter owns the daemon state and performs one request at a time, so
//! the tunnel is started on the first `Connect` and stopped on the last
//! `Disconnect` no matter how client lifetimes overlap.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::daemon::protocol::{self, ProtocolError, Reply, Request};
use crate::tunnel::{
    wait_until_ready, ReadinessPolicy, ReadinessProbe, TunnelController, TunnelEndpoint,
    TunnelError, TunnelHandle, TunnelResult,
};

/// Mutable daemon state
///
/// Between two requests `tunnel.is_some()` holds exactly when `refcount > 0`.
#[derive(Default)]
pub struct DaemonState {
    /// Number of clients currently holding the tunnel
    refcount: u32,
    /// Running tunnel subprocess
    tunnel: Option<TunnelHandle>,
}

impl DaemonState {
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn has_tunnel(&self) -> bool {
        self.tunnel.is_some()
    }
}

/// Serializes tunnel start/stop transitions for all clients
pub struct Arbiter {
    controller: Box<dyn TunnelController>,
    probe: Box<dyn ReadinessProbe>,
    endpoint: TunnelEndpoint,
    policy: ReadinessPolicy,
    state: DaemonState,
}

impl Arbiter {
    pub fn new(
        controller: Box<dyn TunnelController>,
        probe: Box<dyn ReadinessProbe>,
        endpoint: TunnelEndpoint,
        policy: ReadinessPolicy,
    ) -> Self {
        Self {
            controller,
            probe,
            endpoint,
            policy,
            state: DaemonState::default(),
        }
    }

    /// Current daemon state
    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    /// Endpoint this arbiter manages
    pub fn endpoint(&self) -> &TunnelEndpoint {
        &self.endpoint
    }

    /// Serve one control connection: read a request, apply it, reply
    ///
    /// Malformed input is logged and the connection is dropped without a
    /// reply. Only fatal tunnel errors are returned.
    pub async fn handle_connection<S>(&mut self, mut stream: S, peer: &str) -> TunnelResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = match protocol::read_request(&mut stream).await {
            Ok(request) => request,
            Err(ProtocolError::UnknownByte(byte)) => {
                warn!(
                    "Received unexpected byte {:#04x} from {}. Closing connection.",
                    byte, peer
                );
                return Ok(());
            }
            Err(e) => {
                warn!("Failed to read request from {}: {}", peer, e);
                return Ok(());
            }
        };

        debug!("Received {} request from {}", request, peer);
        let reply = self.handle_request(request).await?;

        if let Err(e) = protocol::write_reply(&mut stream, reply).await {
            warn!("Failed to send reply to {}: {}", peer, e);
        }
        Ok(())
    }

    /// Apply a request to the daemon state and return the reply to send
    pub async fn handle_request(&mut self, request: Request) -> TunnelResult<Reply> {
        match request {
            Request::Connect => self.connect().await,
            Request::Disconnect => self.disconnect().await,
        }
    }

    async fn connect(&mut self) -> TunnelResult<Reply> {
        if self.state.refcount == 0 {
            if self.state.tunnel.is_none() {
                let handle = self.controller.start(&self.endpoint).await?;
                self.state.tunnel = Some(handle);
            }
            if let Some(reply) = self.await_readiness().await? {
                return Ok(reply);
            }
        } else if !self.tunnel_alive() {
            warn!(
                "Tunnel process exited while {} client(s) held it. Restarting.",
                self.state.refcount
            );
            self.restart_tunnel().await?;
            if let Some(reply) = self.await_readiness().await? {
                return Ok(reply);
            }
        }

        self.state.refcount += 1;
        info!("Connections: {}.", self.state.refcount);
        Ok(Reply::Ack(Request::Connect))
    }

    async fn disconnect(&mut self) -> TunnelResult<Reply> {
        if self.state.refcount == 0 {
            // Unmatched disconnect: clamp at zero instead of wrapping
            warn!("Disconnect received with no connected clients. Ignoring.");
            return Ok(Reply::Ack(Request::Disconnect));
        }

        self.state.refcount -= 1;
        info!("Connections: {}.", self.state.refcount);

        if self.state.refcount == 0 {
            self.stop_tunnel().await?;
        }
        Ok(Reply::Ack(Request::Disconnect))
    }

    /// Wait for the proxy port; on timeout tear the tunnel down
    ///
    /// Returns `Some(reply)` when the request must be answered with a failure.
    async fn await_readiness(&mut self) -> TunnelResult<Option<Reply>> {
        match wait_until_ready(self.probe.as_ref(), self.endpoint.proxy_port, &self.policy).await {
            Ok(_) => Ok(None),
            Err(e) if !e.is_fatal() => {
                error!("Tunnel to {}: {}. Giving up.", self.endpoint, e);
                self.stop_tunnel().await?;
                self.state.refcount = 0;
                Ok(Some(Reply::Failed))
            }
            Err(e) => Err(e),
        }
    }

    async fn restart_tunnel(&mut self) -> TunnelResult<()> {
        self.stop_tunnel().await?;
        let handle = self.controller.start(&self.endpoint).await?;
        self.state.tunnel = Some(handle);
        Ok(())
    }

    fn tunnel_alive(&mut self) -> bool {
        self.state
            .tunnel
            .as_mut()
            .map(TunnelHandle::is_running)
            .unwrap_or(false)
    }

    async fn stop_tunnel(&mut self) -> TunnelResult<()> {
        if let Some(handle) = self.state.tunnel.take() {
            self.controller.stop(handle).await?;
        }
        Ok(())
    }

    /// Stop the tunnel (if any) before the daemon exits
    pub async fn shutdown(&mut self) -> TunnelResult<()> {
        if self.state.tunnel.is_some() {
            info!(
                "Stopping tunnel on shutdown ({} client(s) connected)",
                self.state.refcount
            );
        }
        self.stop_tunnel().await?;
        self.state.refcount = 0;
        Ok(())
    }
}
