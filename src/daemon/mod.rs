//! Daemon module for the shared SSH tunnel
//!
//! The daemon runs as a separate long-lived process that owns the tunnel.
//! Clients announce when they need it and when they are done; the daemon
//! starts the tunnel for the first client and stops it after the last.

pub mod arbiter;
pub mod client;
pub mod protocol;
pub mod server;

pub use arbiter::{Arbiter, DaemonState};
pub use client::{Acquire, ClientError, TunnelClient};
pub use protocol::{ProtocolError, Reply, Request};
pub use server::{DaemonConfig, DaemonHandle, DaemonServer, ServerError};
