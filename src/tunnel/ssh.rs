//! OpenSSH dynamic port forward controller
//!
//! Runs `ssh -T -n -N -D <proxy_port> -p <remote_port> <host>`: no remote
//! command, no pseudo-terminal, stdin from /dev/null, kept open until killed.

use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use super::{
    binary_exists, TunnelController, TunnelEndpoint, TunnelError, TunnelHandle, TunnelResult,
};

/// Tunnel controller backed by the OpenSSH client
#[derive(Debug, Clone)]
pub struct SshTunnel {
    /// Program to run (normally `ssh`)
    program: String,
    /// Extra options placed before the forwarding flags
    extra_args: Vec<String>,
}

impl SshTunnel {
    /// Create a controller that runs `ssh` from PATH
    pub fn new() -> Self {
        Self::with_command(Self::binary_name(), Vec::new())
    }

    /// Create a controller with a custom program and extra options
    pub fn with_command(program: impl Into<String>, extra_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            extra_args,
        }
    }

    /// Get the default binary name
    pub fn binary_name() -> &'static str {
        "ssh"
    }

    /// Program this controller runs
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Build the argument list for the given endpoint
    pub fn args(&self, endpoint: &TunnelEndpoint) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.extend([
            "-T".to_string(),
            "-n".to_string(),
            "-N".to_string(),
            "-D".to_string(),
            endpoint.proxy_port.to_string(),
            "-p".to_string(),
            endpoint.remote_port.to_string(),
            endpoint.remote_host.clone(),
        ]);
        args
    }
}

impl Default for SshTunnel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelController for SshTunnel {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn is_available(&self) -> bool {
        binary_exists(&self.program)
    }

    async fn start(&self, endpoint: &TunnelEndpoint) -> TunnelResult<TunnelHandle> {
        info!("Starting ssh process for {}", endpoint);

        let args = self.args(endpoint);
        debug!("Running {} {}", self.program, args.join(" "));

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => TunnelError::BinaryNotFound(self.program.clone()),
                _ => TunnelError::SpawnFailed(e),
            })?;

        debug!("ssh process started (pid={:?})", child.id());
        Ok(TunnelHandle::new(child, self.name()))
    }

    async fn stop(&self, mut handle: TunnelHandle) -> TunnelResult<()> {
        info!("Stopping ssh process (pid={:?})", handle.pid());
        handle.terminate().await?;
        Ok(())
    }
}
