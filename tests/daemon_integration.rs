//! End-to-end tests for the tunnel daemon.
//!
//! These tests run a real `DaemonServer` on an ephemeral control port with the
//! mock controller and probe, and talk to it through `TunnelClient` the way
//! `ssh-tunnel connect` does.

use std::sync::Arc;
use std::time::Duration;

use ssh_tunnel::config::{Config, ServeOverrides};
use ssh_tunnel::daemon::{
    Acquire, Arbiter, ClientError, DaemonConfig, DaemonHandle, DaemonServer, TunnelClient,
};
use ssh_tunnel::tunnel::mock::{ControllerStats, MockProbe, MockTunnelController, ProbeStats};
use ssh_tunnel::tunnel::{wait_until_ready, ReadinessPolicy, TcpProbe, TunnelError};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct TestDaemon {
    client: TunnelClient,
    handle: DaemonHandle,
    controller: Arc<ControllerStats>,
    probe: Arc<ProbeStats>,
    task: JoinHandle<Result<(), ssh_tunnel::daemon::ServerError>>,
}

impl TestDaemon {
    async fn start(probe: MockProbe, max_attempts: Option<u32>) -> Self {
        Self::start_with_interval(probe, max_attempts, Duration::from_millis(1)).await
    }

    async fn start_with_interval(
        probe: MockProbe,
        max_attempts: Option<u32>,
        interval: Duration,
    ) -> Self {
        let mut config = DaemonConfig::new("bastion.example.org");
        config.control_port = 0;
        config.readiness = ReadinessPolicy {
            interval,
            max_attempts,
            probe_timeout: Duration::from_millis(50),
        };

        let controller = MockTunnelController::new();
        let controller_stats = controller.stats();
        let probe_stats = probe.stats();
        let arbiter = Arbiter::new(
            Box::new(controller),
            Box::new(probe),
            config.endpoint.clone(),
            config.readiness,
        );

        let server = DaemonServer::bind(&config, arbiter)
            .await
            .expect("Failed to bind daemon");
        let port = server.local_addr().unwrap().port();
        let handle = server.handle();
        let task = tokio::spawn(server.run());

        Self {
            client: TunnelClient::new("127.0.0.1", port),
            handle,
            controller: controller_stats,
            probe: probe_stats,
            task,
        }
    }

    async fn stop(self) {
        self.handle.shutdown();
        self.task
            .await
            .expect("daemon task panicked")
            .expect("daemon returned an error");
    }
}

// ============================================================================
// Reference counting
// ============================================================================

#[tokio::test]
async fn test_single_client_lifecycle() {
    let daemon = TestDaemon::start(MockProbe::ready_after(3), Some(10)).await;

    daemon.client.connect().await.expect("connect failed");
    assert_eq!(daemon.controller.starts(), 1);
    assert_eq!(daemon.probe.calls(), 3);

    daemon.client.disconnect().await.expect("disconnect failed");
    assert_eq!(daemon.controller.stops(), 1);
    assert!(!daemon.controller.is_running());

    daemon.stop().await;
}

#[tokio::test]
async fn test_overlapping_clients_share_one_tunnel() {
    let daemon = TestDaemon::start(MockProbe::always_ready(), Some(10)).await;

    let client = daemon.client.clone();
    let connects = (0..5).map(|_| {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    });
    for task in connects.collect::<Vec<_>>() {
        task.await.unwrap().expect("connect failed");
    }

    assert_eq!(daemon.controller.starts(), 1);
    assert_eq!(daemon.controller.overlapping_starts(), 0);

    let disconnects = (0..4).map(|_| {
        let client = client.clone();
        tokio::spawn(async move { client.disconnect().await })
    });
    for task in disconnects.collect::<Vec<_>>() {
        task.await.unwrap().expect("disconnect failed");
    }

    // One holder left
    assert!(daemon.controller.is_running());
    assert_eq!(daemon.controller.stops(), 0);

    client.disconnect().await.expect("disconnect failed");
    assert_eq!(daemon.controller.stops(), 1);

    daemon.stop().await;
}

#[tokio::test]
async fn test_client_arriving_during_startup_waits_for_readiness() {
    let interval = Duration::from_millis(20);
    let daemon = TestDaemon::start_with_interval(MockProbe::ready_after(5), Some(50), interval).await;

    // Both requests are sent while the first start is still waiting for readiness
    let connects: Vec<_> = (0..2)
        .map(|_| {
            let client = daemon.client.clone();
            let probe = Arc::clone(&daemon.probe);
            tokio::spawn(async move {
                client.connect().await?;
                Ok::<u32, ClientError>(probe.successes())
            })
        })
        .collect();

    for task in connects {
        let successes_at_ack = task.await.unwrap().expect("connect failed");
        assert_eq!(successes_at_ack, 1, "acknowledged before the tunnel was ready");
    }

    assert_eq!(daemon.controller.starts(), 1);
    assert_eq!(daemon.controller.overlapping_starts(), 0);
    assert_eq!(daemon.probe.calls(), 5);

    daemon.client.disconnect().await.expect("disconnect failed");
    assert!(daemon.controller.is_running());
    daemon.client.disconnect().await.expect("disconnect failed");
    assert_eq!(daemon.controller.stops(), 1);

    daemon.stop().await;
}

#[tokio::test]
async fn test_cancelled_client_does_not_hold_tunnel() {
    let interval = Duration::from_millis(50);
    let daemon = TestDaemon::start_with_interval(MockProbe::ready_after(5), None, interval).await;

    let cancel = tokio::time::sleep(Duration::from_millis(50));
    let outcome = daemon
        .client
        .connect_or_cancel(cancel)
        .await
        .expect("connect failed");
    assert_eq!(outcome, Acquire::Cancelled(()));

    // The release is queued behind the abandoned request, so the next
    // holder finds a count of zero and brings up a fresh tunnel
    daemon.client.connect().await.expect("connect failed");
    assert_eq!(daemon.controller.starts(), 2);
    assert_eq!(daemon.controller.stops(), 1);

    daemon.client.disconnect().await.expect("disconnect failed");
    assert_eq!(daemon.controller.stops(), 2);
    assert!(!daemon.controller.is_running());

    daemon.stop().await;
}

#[tokio::test]
async fn test_repeated_sessions_restart_tunnel() {
    let daemon = TestDaemon::start(MockProbe::always_ready(), Some(10)).await;

    for round in 1..=3 {
        daemon.client.connect().await.expect("connect failed");
        daemon.client.disconnect().await.expect("disconnect failed");
        assert_eq!(daemon.controller.starts(), round);
        assert_eq!(daemon.controller.stops(), round);
    }

    daemon.stop().await;
}

#[tokio::test]
async fn test_unmatched_disconnect_does_not_underflow() {
    let daemon = TestDaemon::start(MockProbe::always_ready(), Some(10)).await;

    daemon.client.disconnect().await.expect("disconnect failed");
    daemon.client.disconnect().await.expect("disconnect failed");

    // The next holder still brings the tunnel up
    daemon.client.connect().await.expect("connect failed");
    assert_eq!(daemon.controller.starts(), 1);
    assert!(daemon.controller.is_running());

    daemon.client.disconnect().await.expect("disconnect failed");
    assert_eq!(daemon.controller.stops(), 1);

    daemon.stop().await;
}

// ============================================================================
// Readiness and shutdown
// ============================================================================

#[tokio::test]
async fn test_readiness_ceiling_fails_connect() {
    let daemon = TestDaemon::start(MockProbe::never_ready(), Some(4)).await;

    let result = daemon.client.connect().await;
    assert!(matches!(result, Err(ClientError::TunnelFailed)));
    assert_eq!(daemon.probe.calls(), 4);
    assert_eq!(daemon.controller.starts(), 1);
    assert_eq!(daemon.controller.stops(), 1);

    daemon.stop().await;
}

#[tokio::test]
async fn test_shutdown_stops_held_tunnel() {
    let daemon = TestDaemon::start(MockProbe::always_ready(), Some(10)).await;

    daemon.client.connect().await.expect("connect failed");
    daemon.client.connect().await.expect("connect failed");
    assert!(daemon.controller.is_running());

    let controller = Arc::clone(&daemon.controller);
    let client = daemon.client.clone();
    daemon.stop().await;

    assert_eq!(controller.stops(), 1);
    assert!(!controller.is_running());

    // Nothing is listening any more
    let result = client.connect().await;
    assert!(matches!(result, Err(ClientError::DaemonNotRunning(_))));
}

#[tokio::test]
async fn test_tcp_probe_waits_for_listener() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let policy = ReadinessPolicy {
        interval: Duration::from_millis(20),
        max_attempts: Some(200),
        probe_timeout: Duration::from_millis(100),
    };

    let opener = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        TcpListener::bind(("127.0.0.1", port)).await
    });

    let probe = TcpProbe::new(policy.probe_timeout);
    let attempts = wait_until_ready(&probe, port, &policy)
        .await
        .expect("port never became ready");
    assert!(attempts > 1);

    let _listener = opener.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_tcp_probe_gives_up() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let policy = ReadinessPolicy {
        interval: Duration::from_millis(1),
        max_attempts: Some(3),
        probe_timeout: Duration::from_millis(50),
    };

    let result = wait_until_ready(&TcpProbe::new(policy.probe_timeout), port, &policy).await;
    assert!(matches!(result, Err(TunnelError::NotReady { attempts: 3 })));
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn test_daemon_from_config_file() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
            control_port = 0
            proxy_port = 9050
            readiness_interval_ms = 1
            readiness_max_attempts = 2
        "#,
    )
    .unwrap();

    let config = Config::load_from(&path).unwrap();
    let daemon_config = config.daemon_config("bastion.example.org", &ServeOverrides::default());
    assert_eq!(daemon_config.endpoint.proxy_port, 9050);
    assert_eq!(daemon_config.readiness.max_attempts, Some(2));

    let controller = MockTunnelController::new();
    let stats = controller.stats();
    let arbiter = Arbiter::new(
        Box::new(controller),
        Box::new(MockProbe::never_ready()),
        daemon_config.endpoint.clone(),
        daemon_config.readiness,
    );
    let server = DaemonServer::bind(&daemon_config, arbiter).await.unwrap();
    let client = TunnelClient::new("127.0.0.1", server.local_addr().unwrap().port());
    let handle = server.handle();
    let task = tokio::spawn(server.run());

    assert!(matches!(
        client.connect().await,
        Err(ClientError::TunnelFailed)
    ));
    assert_eq!(stats.stops(), 1);

    handle.shutdown();
    task.await.unwrap().unwrap();
}
