//! Readiness probing for the local SOCKS endpoint

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use super::{TunnelError, TunnelResult};

/// Default pause between two probes
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of probes before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;

/// Default timeout for a single probe connection
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long and how often to wait for the tunnel to come up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Pause between failed probes
    pub interval: Duration,
    /// Give up after this many probes (`None` waits forever)
    pub max_attempts: Option<u32>,
    /// Connect timeout for a single probe
    pub probe_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Answers "is the local tunnel endpoint accepting connections yet?"
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, port: u16) -> bool;
}

/// Probe that opens (and immediately closes) a TCP connection
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: IpAddr,
    timeout: Duration,
}

impl TcpProbe {
    /// Probe 127.0.0.1 with the given connect timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            timeout,
        }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn probe(&self, port: u16) -> bool {
        let addr = SocketAddr::new(self.host, port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", addr, e);
                false
            }
            Err(_) => {
                debug!("Probe of {} timed out", addr);
                false
            }
        }
    }
}

/// Probe `port` until it answers or the policy runs out of attempts
///
/// Returns the number of probes it took.
pub async fn wait_until_ready(
    probe: &dyn ReadinessProbe,
    port: u16,
    policy: &ReadinessPolicy,
) -> TunnelResult<u32> {
    let mut attempts = 0u32;
    loop {
        attempts = attempts.saturating_add(1);
        if probe.probe(port).await {
            debug!("Tunnel ready on port {} after {} probe(s)", port, attempts);
            return Ok(attempts);
        }

        if let Some(max) = policy.max_attempts {
            if attempts >= max {
                return Err(TunnelError::NotReady { attempts });
            }
        }

        tokio::time::sleep(policy.interval).await;
    }
}
