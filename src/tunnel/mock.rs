//! Mock tunnel controller and readiness probe for testing.
//!
//! Provides configurable implementations of `TunnelController` and
//! `ReadinessProbe` that never spawn subprocesses or touch the network. Both
//! record how often they were called so tests can check that the tunnel is
//! started and stopped exactly when it should be.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    ReadinessProbe, TunnelController, TunnelEndpoint, TunnelError, TunnelHandle, TunnelResult,
};

/// Type of error to simulate.
#[derive(Debug, Clone)]
pub enum MockError {
    /// Simulate a missing binary on `start`.
    BinaryNotFound,
    /// Simulate a failed signal delivery on `stop`.
    SignalFailed,
}

/// Configuration for mock controller behavior.
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    /// Simulated startup delay before `start` returns.
    pub startup_delay: Option<Duration>,
    /// If set, `start` fails with this error.
    pub start_error: Option<MockError>,
    /// If set, `stop` fails with this error.
    pub stop_error: Option<MockError>,
}

impl MockConfig {
    /// Create a config with a startup delay.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            startup_delay: Some(delay),
            ..Default::default()
        }
    }

    /// Create a config where `start` fails.
    pub fn failing_start(error: MockError) -> Self {
        Self {
            start_error: Some(error),
            ..Default::default()
        }
    }

    /// Create a config where `stop` fails.
    pub fn failing_stop(error: MockError) -> Self {
        Self {
            stop_error: Some(error),
            ..Default::default()
        }
    }
}

/// Counters shared between a mock controller and the test observing it.
#[derive(Debug, Default)]
pub struct ControllerStats {
    starts: AtomicUsize,
    stops: AtomicUsize,
    running: AtomicBool,
    overlapping_starts: AtomicUsize,
}

impl ControllerStats {
    /// Number of successful `start` calls.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of successful `stop` calls.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Whether a started tunnel has not been stopped yet.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of `start` calls made while a tunnel was already running.
    pub fn overlapping_starts(&self) -> usize {
        self.overlapping_starts.load(Ordering::SeqCst)
    }
}

/// Mock tunnel controller for testing.
///
/// Hands out detached `TunnelHandle`s and counts `start`/`stop` calls.
///
/// # Examples
///
/// ```ignore
/// use ssh_tunnel::tunnel::mock::MockTunnelController;
///
/// let controller = MockTunnelController::new();
/// let stats = controller.stats();
/// // hand `controller` to an Arbiter, then:
/// assert_eq!(stats.starts(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct MockTunnelController {
    config: Arc<MockConfig>,
    stats: Arc<ControllerStats>,
}

impl MockTunnelController {
    /// Create a new mock controller with default configuration.
    pub fn new() -> Self {
        Self::with_config(MockConfig::default())
    }

    /// Create a mock controller with custom configuration.
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config: Arc::new(config),
            stats: Arc::new(ControllerStats::default()),
        }
    }

    /// Shared counters for this controller.
    pub fn stats(&self) -> Arc<ControllerStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for MockTunnelController {
    fn default() -> Self {
        Self::new()
    }
}

fn simulated(error: &MockError) -> TunnelError {
    match error {
        MockError::BinaryNotFound => TunnelError::BinaryNotFound("mock-ssh".to_string()),
        MockError::SignalFailed => TunnelError::SignalFailed {
            pid: 0,
            reason: "simulated".to_string(),
        },
    }
}

#[async_trait]
impl TunnelController for MockTunnelController {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn start(&self, _endpoint: &TunnelEndpoint) -> TunnelResult<TunnelHandle> {
        if let Some(delay) = self.config.startup_delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(ref err) = self.config.start_error {
            return Err(simulated(err));
        }

        if self.stats.running.swap(true, Ordering::SeqCst) {
            self.stats.overlapping_starts.fetch_add(1, Ordering::SeqCst);
        }
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        Ok(TunnelHandle::detached(self.name()))
    }

    async fn stop(&self, mut handle: TunnelHandle) -> TunnelResult<()> {
        if let Some(ref err) = self.config.stop_error {
            return Err(simulated(err));
        }

        handle.terminate().await?;
        self.stats.running.store(false, Ordering::SeqCst);
        self.stats.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Counters shared between a mock probe and the test observing it.
#[derive(Debug, Default)]
pub struct ProbeStats {
    calls: AtomicU32,
    successes: AtomicU32,
}

impl ProbeStats {
    /// Total number of probes.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of probes that reported the endpoint as ready.
    pub fn successes(&self) -> u32 {
        self.successes.load(Ordering::SeqCst)
    }

    /// Forget previous calls, so the next wait starts from scratch.
    pub fn reset(&self) {
        self.calls.store(0, Ordering::SeqCst);
        self.successes.store(0, Ordering::SeqCst);
    }
}

/// Mock readiness probe that succeeds from the N-th call on.
#[derive(Debug, Clone)]
pub struct MockProbe {
    ready_after: Option<u32>,
    stats: Arc<ProbeStats>,
}

impl MockProbe {
    /// Report ready from the `n`-th probe on (counted since the last reset).
    pub fn ready_after(n: u32) -> Self {
        Self {
            ready_after: Some(n),
            stats: Arc::new(ProbeStats::default()),
        }
    }

    /// Report ready on the first probe.
    pub fn always_ready() -> Self {
        Self::ready_after(1)
    }

    /// Never report ready.
    pub fn never_ready() -> Self {
        Self {
            ready_after: None,
            stats: Arc::new(ProbeStats::default()),
        }
    }

    /// Shared counters for this probe.
    pub fn stats(&self) -> Arc<ProbeStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl ReadinessProbe for MockProbe {
    async fn probe(&self, _port: u16) -> bool {
        let call = self.stats.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let ready = self.ready_after.is_some_and(|n| call >= n);
        if ready {
            self.stats.successes.fetch_add(1, Ordering::SeqCst);
        }
        ready
    }
}
