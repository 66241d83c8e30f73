//! Daemon client for the tunnel control protocol
//!
//! `TunnelClient` opens one short-lived TCP connection per request, sends the
//! request byte and waits for the daemon to echo it back. A `Connect` can take
//! as long as the tunnel needs to come up, so by default there is no reply
//! timeout.

use crate::daemon::protocol::{self, ProtocolError, Reply, Request};
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Timeout for establishing the control connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur when communicating with the daemon
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Could not connect to ssh-tunnel daemon running on {0}")]
    DaemonNotRunning(String),

    #[error("Failed to connect to daemon: {0}")]
    ConnectionFailed(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Connection closed by daemon")]
    ConnectionClosed,

    #[error("Daemon could not bring up the tunnel")]
    TunnelFailed,

    #[error("Received incorrect response from daemon: expected {expected:#04x}, got {actual:#04x}")]
    UnexpectedResponse { expected: u8, actual: u8 },
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => ClientError::Io(e),
            ProtocolError::Closed => ClientError::ConnectionClosed,
            ProtocolError::UnknownByte(actual) => ClientError::UnexpectedResponse {
                expected: 0,
                actual,
            },
        }
    }
}

/// Result of a `Connect` that may be abandoned before the daemon answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire<T> {
    /// The daemon acknowledged; the tunnel is usable
    Held,
    /// The cancel future finished first and the request was released
    Cancelled(T),
}

/// Client for announcing tunnel use to the daemon
#[derive(Debug, Clone)]
pub struct TunnelClient {
    host: String,
    port: u16,
    reply_timeout: Option<Duration>,
}

impl TunnelClient {
    /// Create a client for the daemon at `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            reply_timeout: None,
        }
    }

    /// Stop waiting for a reply after `timeout`
    ///
    /// A `Connect` that times out is released with a `Disconnect`.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    /// `host:port` of the daemon
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Ask the daemon for the tunnel; returns once it is usable
    pub async fn connect(&self) -> Result<(), ClientError> {
        match self
            .connect_or_cancel(std::future::pending::<Infallible>())
            .await?
        {
            Acquire::Held => Ok(()),
            Acquire::Cancelled(never) => match never {},
        }
    }

    /// Ask the daemon for the tunnel unless `cancel` finishes first
    ///
    /// Once the request byte is sent the daemon will count this client, even
    /// if nobody reads the reply. Giving up (on `cancel` or the reply timeout)
    /// therefore sends a `Disconnect`, which the daemon applies after the
    /// pending `Connect` since it serves connections in order.
    pub async fn connect_or_cancel<F>(&self, cancel: F) -> Result<Acquire<F::Output>, ClientError>
    where
        F: Future,
    {
        let mut stream = self.open().await?;
        debug!("Sending {} request to {}", Request::Connect, self.address());
        protocol::write_request(&mut stream, Request::Connect).await?;

        let waited = tokio::select! {
            reply = self.wait_for_reply(&mut stream, Request::Connect) => Ok(reply),
            value = cancel => Err(value),
        };
        drop(stream);

        match waited {
            Ok(Err(ClientError::Timeout)) => {
                self.release_abandoned().await;
                Err(ClientError::Timeout)
            }
            Ok(reply) => reply.map(|()| Acquire::Held),
            Err(value) => {
                self.release_abandoned().await;
                Ok(Acquire::Cancelled(value))
            }
        }
    }

    /// Tell the daemon this client is done with the tunnel
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let mut stream = self.open().await?;
        debug!("Sending {} request to {}", Request::Disconnect, self.address());
        protocol::write_request(&mut stream, Request::Disconnect).await?;
        self.wait_for_reply(&mut stream, Request::Disconnect).await
    }

    /// Send a `Disconnect` for a `Connect` whose reply will not be read
    ///
    /// The reply to this request is not awaited either; the daemon reads the
    /// byte even after this side has closed.
    async fn release_abandoned(&self) {
        let sent = async {
            let mut stream = self.open().await?;
            protocol::write_request(&mut stream, Request::Disconnect).await?;
            Ok::<(), ClientError>(())
        };

        match sent.await {
            Ok(()) => debug!("Released abandoned tunnel request at {}", self.address()),
            Err(e) => warn!(
                "Could not release abandoned tunnel request at {}: {}",
                self.address(),
                e
            ),
        }
    }

    /// Wait for the reply to `request` and check that it acknowledges it
    async fn wait_for_reply(
        &self,
        stream: &mut TcpStream,
        request: Request,
    ) -> Result<(), ClientError> {
        let read = protocol::read_reply(stream);
        let reply = match self.reply_timeout {
            Some(timeout) => tokio::time::timeout(timeout, read)
                .await
                .map_err(|_| ClientError::Timeout)?,
            None => read.await,
        }
        .map_err(|e| match ClientError::from(e) {
            ClientError::UnexpectedResponse { actual, .. } => ClientError::UnexpectedResponse {
                expected: request.as_byte(),
                actual,
            },
            other => other,
        })?;

        debug!("Received reply {:?}", reply);
        match reply {
            r if r.acknowledges(request) => Ok(()),
            Reply::Failed => Err(ClientError::TunnelFailed),
            other => Err(ClientError::UnexpectedResponse {
                expected: request.as_byte(),
                actual: other.as_byte(),
            }),
        }
    }

    async fn open(&self) -> Result<TcpStream, ClientError> {
        let addr = self.address();
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                    Err(ClientError::DaemonNotRunning(addr))
                }
                _ => Err(ClientError::ConnectionFailed(e)),
            },
            Err(_) => Err(ClientError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::arbiter::Arbiter;
    use crate::daemon::server::{DaemonConfig, DaemonHandle, DaemonServer};
    use crate::tunnel::mock::{ControllerStats, MockProbe, MockTunnelController};
    use crate::tunnel::ReadinessPolicy;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn fast_policy() -> ReadinessPolicy {
        ReadinessPolicy {
            interval: Duration::from_millis(1),
            max_attempts: Some(3),
            probe_timeout: Duration::from_millis(50),
        }
    }

    /// Readiness that takes about half a second and never gives up
    fn slow_policy() -> ReadinessPolicy {
        ReadinessPolicy {
            interval: Duration::from_millis(50),
            max_attempts: None,
            probe_timeout: Duration::from_millis(50),
        }
    }

    /// Helper to start a test daemon and return a client for it
    async fn create_test_setup(probe: MockProbe) -> (TunnelClient, DaemonHandle, Arc<ControllerStats>) {
        create_test_setup_with(probe, fast_policy()).await
    }

    async fn create_test_setup_with(
        probe: MockProbe,
        readiness: ReadinessPolicy,
    ) -> (TunnelClient, DaemonHandle, Arc<ControllerStats>) {
        let mut config = DaemonConfig::new("mock.example.org");
        config.control_port = 0;
        config.readiness = readiness;

        let controller = MockTunnelController::new();
        let stats = controller.stats();
        let arbiter = Arbiter::new(
            Box::new(controller),
            Box::new(probe),
            config.endpoint.clone(),
            config.readiness,
        );
        let server = DaemonServer::bind(&config, arbiter)
            .await
            .expect("Failed to bind test server");
        let port = server.local_addr().unwrap().port();
        let handle = server.handle();
        tokio::spawn(server.run());

        (TunnelClient::new("127.0.0.1", port), handle, stats)
    }

    /// Listener that answers every request with a fixed byte
    async fn fake_daemon(reply: u8) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1];
                let _ = stream.read_exact(&mut buf).await;
                let _ = stream.write_all(&[reply]).await;
            }
        });
        port
    }

    /// Wait until the daemon has stopped the tunnel `n` times
    async fn wait_for_stops(stats: &ControllerStats, n: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while stats.stops() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "tunnel was never stopped");
    }

    #[test]
    fn test_client_address() {
        let client = TunnelClient::new("10.0.0.1", 4000);
        assert_eq!(client.address(), "10.0.0.1:4000");
    }

    #[test]
    fn test_no_reply_timeout_by_default() {
        let client = TunnelClient::new("127.0.0.1", 1081);
        assert!(client.reply_timeout.is_none());

        let client = client.with_reply_timeout(Duration::from_secs(1));
        assert_eq!(client.reply_timeout, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_connect_waits_for_slow_tunnel() {
        let (client, handle, stats) =
            create_test_setup_with(MockProbe::ready_after(5), slow_policy()).await;

        client.connect().await.expect("connect failed");
        assert_eq!(stats.starts(), 1);
        assert!(stats.is_running());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_reply_timeout_releases_pending_connect() {
        let (client, handle, stats) =
            create_test_setup_with(MockProbe::ready_after(10), slow_policy()).await;
        let client = client.with_reply_timeout(Duration::from_millis(100));

        let result = client.connect().await;
        assert!(matches!(result, Err(ClientError::Timeout)));

        // The daemon finishes the start, counts the client, then applies the release
        wait_for_stops(&stats, 1).await;
        assert_eq!(stats.starts(), 1);
        assert!(!stats.is_running());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_cancelled_connect_is_released() {
        let (client, handle, stats) =
            create_test_setup_with(MockProbe::ready_after(10), slow_policy()).await;

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            "stop"
        };
        let outcome = client.connect_or_cancel(cancel).await.expect("connect failed");
        assert_eq!(outcome, Acquire::Cancelled("stop"));

        wait_for_stops(&stats, 1).await;
        assert_eq!(stats.starts(), 1);
        assert!(!stats.is_running());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_connect_or_cancel_held() {
        let (client, handle, stats) = create_test_setup(MockProbe::always_ready()).await;

        let outcome = client
            .connect_or_cancel(std::future::pending::<()>())
            .await
            .expect("connect failed");
        assert_eq!(outcome, Acquire::Held);
        assert!(stats.is_running());

        client.disconnect().await.expect("disconnect failed");
        assert_eq!(stats.stops(), 1);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_connect_daemon_not_running() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = TunnelClient::new("127.0.0.1", port).connect().await;
        assert!(matches!(result, Err(ClientError::DaemonNotRunning(_))));
    }

    #[tokio::test]
    async fn test_connect_then_disconnect() {
        let (client, handle, stats) = create_test_setup(MockProbe::always_ready()).await;

        client.connect().await.expect("connect failed");
        assert_eq!(stats.starts(), 1);
        assert!(stats.is_running());

        client.disconnect().await.expect("disconnect failed");
        assert_eq!(stats.stops(), 1);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_connect_tunnel_never_ready() {
        let (client, handle, stats) = create_test_setup(MockProbe::never_ready()).await;

        let result = client.connect().await;
        assert!(matches!(result, Err(ClientError::TunnelFailed)));
        assert_eq!(stats.starts(), 1);
        assert_eq!(stats.stops(), 1);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_unmatched_disconnect_is_acknowledged() {
        let (client, handle, stats) = create_test_setup(MockProbe::always_ready()).await;

        client.disconnect().await.expect("disconnect failed");
        assert_eq!(stats.stops(), 0);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_mismatched_reply() {
        let port = fake_daemon(b'D').await;
        let result = TunnelClient::new("127.0.0.1", port).connect().await;
        match result {
            Err(ClientError::UnexpectedResponse { expected, actual }) => {
                assert_eq!(expected, b'C');
                assert_eq!(actual, b'D');
            }
            other => panic!("Expected UnexpectedResponse, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_reply() {
        let port = fake_daemon(b'?').await;
        let result = TunnelClient::new("127.0.0.1", port).disconnect().await;
        assert!(matches!(
            result,
            Err(ClientError::UnexpectedResponse {
                expected: b'D',
                actual: b'?'
            })
        ));
    }

    #[tokio::test]
    async fn test_daemon_closes_without_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let result = TunnelClient::new("127.0.0.1", port).connect().await;
        assert!(matches!(
            result,
            Err(ClientError::ConnectionClosed) | Err(ClientError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_reply_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Accept and hold the connection open without answering
            let held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(held);
        });

        let client = TunnelClient::new("127.0.0.1", port)
            .with_reply_timeout(Duration::from_millis(100));
        let result = client.connect().await;
        assert!(matches!(result, Err(ClientError::Timeout)));
    }
}
