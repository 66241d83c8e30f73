//! Configuration management for ssh-tunnel
//!
//! Handles loading and saving configuration from ~/.config/ssh-tunnel/config.toml.
//! Every value is optional; command-line flags take precedence over the file,
//! and the file over built-in defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::daemon::server::{
    DaemonConfig, DEFAULT_CONTROL_PORT, DEFAULT_PROXY_PORT, DEFAULT_REMOTE_PORT,
};
use crate::relay::DEFAULT_RELAY_COMMAND;
use crate::tunnel::{ReadinessPolicy, SshTunnel, TunnelEndpoint};

/// Configuration file name
const CONFIG_FILE: &str = "config.toml";

/// Application name for config directory
const APP_NAME: &str = "ssh-tunnel";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Remote SSH port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,

    /// Local SOCKS proxy port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,

    /// Daemon control port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_port: Option<u16>,

    /// Explicit control bind address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Accept control connections from other machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_remote: Option<bool>,

    /// Append daemon logs to this file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,

    /// ssh binary to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_command: Option<String>,

    /// Extra options passed to ssh before the forwarding flags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_options: Option<Vec<String>>,

    /// Pause between readiness probes, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_interval_ms: Option<u64>,

    /// Probes before a connect fails; 0 waits forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_max_attempts: Option<u32>,

    /// Connect timeout of a single probe, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_timeout_ms: Option<u64>,

    /// Relay binary used by `connect` (netcat with SOCKS support)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_command: Option<String>,
}

/// Values given on the command line for `serve`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServeOverrides {
    pub remote_port: Option<u16>,
    pub proxy_port: Option<u16>,
    pub control_port: Option<u16>,
    pub bind: Option<String>,
    pub accept_remote: bool,
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the config file path
    ///
    /// Returns ~/.config/ssh-tunnel/config.toml on Linux
    pub fn config_path() -> ConfigResult<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Get the config directory path
    fn config_dir() -> ConfigResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(APP_NAME))
    }

    /// Load configuration from the default file
    ///
    /// Returns default config if the file doesn't exist
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &std::path::Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Check if any configuration is set
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Readiness policy with defaults filled in
    pub fn readiness_policy(&self) -> ReadinessPolicy {
        let defaults = ReadinessPolicy::default();
        ReadinessPolicy {
            interval: self
                .readiness_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.interval),
            max_attempts: match self.readiness_max_attempts {
                Some(0) => None,
                Some(n) => Some(n),
                None => defaults.max_attempts,
            },
            probe_timeout: self
                .probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
        }
    }

    /// Tunnel controller configured from `ssh_command` and `ssh_options`
    pub fn ssh_tunnel(&self) -> SshTunnel {
        SshTunnel::with_command(
            self.ssh_command
                .clone()
                .unwrap_or_else(|| SshTunnel::binary_name().to_string()),
            self.ssh_options.clone().unwrap_or_default(),
        )
    }

    /// Effective relay binary
    pub fn relay_command(&self) -> &str {
        self.relay_command.as_deref().unwrap_or(DEFAULT_RELAY_COMMAND)
    }

    /// Effective proxy port (CLI, then config, then default)
    pub fn effective_proxy_port(&self, cli_port: Option<u16>) -> u16 {
        cli_port
            .or(self.proxy_port)
            .unwrap_or(DEFAULT_PROXY_PORT)
    }

    /// Effective control port (CLI, then config, then default)
    pub fn effective_control_port(&self, cli_port: Option<u16>) -> u16 {
        cli_port
            .or(self.control_port)
            .unwrap_or(DEFAULT_CONTROL_PORT)
    }

    /// Build the daemon settings for `remote_host`
    pub fn daemon_config(&self, remote_host: &str, overrides: &ServeOverrides) -> DaemonConfig {
        let endpoint = TunnelEndpoint::new(
            remote_host,
            overrides
                .remote_port
                .or(self.remote_port)
                .unwrap_or(DEFAULT_REMOTE_PORT),
            self.effective_proxy_port(overrides.proxy_port),
        );

        DaemonConfig {
            endpoint,
            control_port: self.effective_control_port(overrides.control_port),
            bind_host: overrides.bind.clone().or_else(|| self.bind.clone()),
            accept_remote: overrides.accept_remote || self.accept_remote.unwrap_or(false),
            readiness: self.readiness_policy(),
        }
    }
}

fn or_unset<T: std::fmt::Display>(value: &Option<T>, default: impl std::fmt::Display) -> String {
    match value {
        Some(v) => v.to_string(),
        None => format!("(not set, using {})", default),
    }
}

/// Format the configuration for display
pub fn format_config(config: &Config) -> String {
    let mut lines = Vec::new();

    lines.push("Current configuration:".to_string());
    lines.push(String::new());

    lines.push(format!(
        "  remote_port = {}",
        or_unset(&config.remote_port, DEFAULT_REMOTE_PORT)
    ));
    lines.push(format!(
        "  proxy_port = {}",
        or_unset(&config.proxy_port, DEFAULT_PROXY_PORT)
    ));
    lines.push(format!(
        "  control_port = {}",
        or_unset(&config.control_port, DEFAULT_CONTROL_PORT)
    ));
    lines.push(format!("  bind = {}", or_unset(&config.bind, "loopback")));
    lines.push(format!(
        "  accept_remote = {}",
        or_unset(&config.accept_remote, false)
    ));

    if let Some(ref log_file) = config.log_file {
        lines.push(format!("  log_file = \"{}\"", log_file));
    } else {
        lines.push("  log_file = (not set)".to_string());
    }

    lines.push(format!(
        "  ssh_command = {}",
        or_unset(&config.ssh_command, SshTunnel::binary_name())
    ));
    match config.ssh_options {
        Some(ref options) if !options.is_empty() => {
            lines.push(format!("  ssh_options = {:?}", options));
        }
        _ => lines.push("  ssh_options = (not set)".to_string()),
    }

    let policy = config.readiness_policy();
    lines.push(format!(
        "  readiness_interval_ms = {}",
        policy.interval.as_millis()
    ));
    match policy.max_attempts {
        Some(n) => lines.push(format!("  readiness_max_attempts = {}", n)),
        None => lines.push("  readiness_max_attempts = 0 (wait forever)".to_string()),
    }
    lines.push(format!(
        "  probe_timeout_ms = {}",
        policy.probe_timeout.as_millis()
    ));
    lines.push(format!(
        "  relay_command = {}",
        or_unset(&config.relay_command, DEFAULT_RELAY_COMMAND)
    ));

    lines.join("\n")
}
