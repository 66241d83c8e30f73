use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

use ssh_tunnel::config::{format_config, Config, ServeOverrides};
use ssh_tunnel::daemon::{Acquire, Arbiter, DaemonServer, TunnelClient};
use ssh_tunnel::logging::{init_logging, LogConfig, Verbosity};
use ssh_tunnel::relay::{RelayCommand, RelayExit, StopSignals, DEFAULT_PROXY_HOST};
use ssh_tunnel::tunnel::{TcpProbe, TunnelController};

#[derive(Parser)]
#[command(name = "ssh-tunnel")]
#[command(version)]
#[command(about = "Share one SSH SOCKS tunnel between many short-lived clients")]
#[command(
    long_about = "Keeps an `ssh -D` SOCKS proxy up while at least one client needs it. Run `serve` once per bastion host and use `connect` as an ssh ProxyCommand."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel daemon for a remote host
    Serve(ServeArgs),
    /// Relay stdio to HOST:PORT through the shared tunnel
    #[command(disable_help_flag = true)]
    Connect(ConnectArgs),
    /// Show the configuration file values
    Config,
}

#[derive(Args)]
struct ServeArgs {
    /// Host to open the SSH tunnel to
    hostname: String,

    /// Local SOCKS proxy port (default: 1080)
    #[arg(short = 'd', long)]
    proxy_port: Option<u16>,

    /// Remote SSH port (default: 22)
    #[arg(short = 'p', long)]
    remote_port: Option<u16>,

    /// Control port clients connect to (default: 1081)
    #[arg(short = 't', long)]
    control_port: Option<u16>,

    /// Address to bind the control port to
    #[arg(short = 'b', long)]
    bind: Option<String>,

    /// Accept control connections from other machines
    #[arg(short = 'r', long)]
    accept_remote: bool,

    /// Stay in the foreground and log to stderr
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Append logs to this file
    #[arg(short = 'l', long)]
    log_file: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Set on the re-spawned background process
    #[arg(long, hide = true)]
    detached: bool,
}

impl ServeArgs {
    fn overrides(&self) -> ServeOverrides {
        ServeOverrides {
            remote_port: self.remote_port,
            proxy_port: self.proxy_port,
            control_port: self.control_port,
            bind: self.bind.clone(),
            accept_remote: self.accept_remote,
        }
    }
}

#[derive(Args)]
struct ConnectArgs {
    /// Target host, resolved on the far side of the tunnel
    host: String,

    /// Target port
    port: u16,

    /// Host running the SOCKS proxy and the daemon
    #[arg(short = 'h', long, default_value = DEFAULT_PROXY_HOST)]
    proxy_host: String,

    /// SOCKS proxy port (default: 1080)
    #[arg(short = 'p', long)]
    proxy_port: Option<u16>,

    /// Daemon control port (default: 1081)
    #[arg(short = 't', long)]
    control_port: Option<u16>,

    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Connect(args) => match connect(args).await {
            Ok(code) => std::process::exit(code),
            Err(e) => {
                eprintln!("ssh-tunnel: {:#}", e);
                std::process::exit(1);
            }
        },
        Commands::Config => {
            let config = Config::load().context("Failed to load config")?;
            if let Ok(path) = Config::config_path() {
                println!("Config file: {}", path.display());
            }
            if config.is_empty() {
                println!("No values set; built-in defaults apply.");
            }
            println!("{}", format_config(&config));
            Ok(())
        }
    }
}

/// Run the daemon, detaching first unless asked to stay in the foreground
async fn serve(args: ServeArgs) -> Result<()> {
    let config = Config::load().context("Failed to load config")?;

    let log_file = match args.log_file.clone() {
        Some(path) => Some(path),
        None => config.log_file.as_ref().map(PathBuf::from),
    }
    .map(|path| absolute_path(&path))
    .transpose()
    .context("Failed to resolve log file path")?;

    if !args.foreground {
        return detach(&args, log_file.as_deref());
    }

    let verbosity = Verbosity::from_count(args.verbose);
    let log_file = log_file.map(|path| path.to_string_lossy().into_owned());
    let log_config = if args.detached {
        LogConfig::detached(verbosity, log_file)
    } else {
        LogConfig::foreground(verbosity, log_file)
    };
    let _guard = init_logging(&log_config);

    let daemon_config = config.daemon_config(&args.hostname, &args.overrides());
    let controller = config.ssh_tunnel();
    if !controller.is_available() {
        warn!(
            "'{}' was not found on PATH; tunnel starts will fail",
            controller.program()
        );
    }

    let probe = TcpProbe::new(daemon_config.readiness.probe_timeout);
    let arbiter = Arbiter::new(
        Box::new(controller),
        Box::new(probe),
        daemon_config.endpoint.clone(),
        daemon_config.readiness,
    );

    let server = DaemonServer::bind(&daemon_config, arbiter)
        .await
        .inspect_err(|e| error!("{}", e))
        .context("Failed to start daemon")?;

    server
        .run()
        .await
        .inspect_err(|e| error!("Daemon exited: {}", e))
        .context("Daemon failed")?;

    Ok(())
}

/// Re-spawn this binary in the background and return
#[cfg(unix)]
fn detach(args: &ServeArgs, log_file: Option<&Path>) -> Result<()> {
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    let exe = std::env::current_exe().context("Failed to get current executable")?;

    let mut child_args: Vec<String> = vec![
        "serve".to_string(),
        "--foreground".to_string(),
        "--detached".to_string(),
    ];
    let mut push_opt = |flag: &str, value: Option<String>| {
        if let Some(value) = value {
            child_args.push(flag.to_string());
            child_args.push(value);
        }
    };
    push_opt("--proxy-port", args.proxy_port.map(|p| p.to_string()));
    push_opt("--remote-port", args.remote_port.map(|p| p.to_string()));
    push_opt("--control-port", args.control_port.map(|p| p.to_string()));
    push_opt("--bind", args.bind.clone());
    push_opt(
        "--log-file",
        log_file.map(|p| p.to_string_lossy().into_owned()),
    );
    if args.accept_remote {
        child_args.push("--accept-remote".to_string());
    }
    for _ in 0..args.verbose {
        child_args.push("-v".to_string());
    }
    child_args.push(args.hostname.clone());

    Command::new(&exe)
        .args(&child_args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .current_dir("/")
        .process_group(0)
        .spawn()
        .context("Failed to spawn daemon process")?;

    Ok(())
}

#[cfg(not(unix))]
fn detach(_args: &ServeArgs, _log_file: Option<&Path>) -> Result<()> {
    anyhow::bail!("Running in the background is not supported on this platform; use --foreground")
}

/// Resolve `path` against the current directory
fn absolute_path(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Hold the tunnel for the lifetime of one relay
async fn connect(args: ConnectArgs) -> Result<i32> {
    let _guard = init_logging(&LogConfig::foreground(Verbosity::Quiet, None));
    let config = Config::load().context("Failed to load config")?;

    let mut signals = StopSignals::install().context("Failed to install signal handlers")?;

    let control_port = config.effective_control_port(args.control_port);
    let client = TunnelClient::new(args.proxy_host.as_str(), control_port);
    let acquired = client
        .connect_or_cancel(signals.recv())
        .await
        .with_context(|| format!("Could not acquire tunnel from {}", client.address()))?;

    if let Acquire::Cancelled(signal) = acquired {
        return Ok(RelayExit::Interrupted(signal).exit_code());
    }

    let relay = RelayCommand::new(
        args.proxy_host.as_str(),
        config.effective_proxy_port(args.proxy_port),
        args.host.as_str(),
        args.port,
    )
    .with_program(config.relay_command());

    let outcome = relay.run(&mut signals).await;
    let released = client.disconnect().await;

    let exit = outcome.context("Relay failed")?;
    released.with_context(|| format!("Could not release tunnel at {}", client.address()))?;

    Ok(exit.exit_code())
}
