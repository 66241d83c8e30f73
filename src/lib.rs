//! Share one SSH SOCKS tunnel between many short-lived clients.
//!
//! A long-running daemon keeps an `ssh -D` dynamic forward up for as long as
//! at least one client holds it. Clients announce themselves over a one-byte
//! TCP control protocol, then relay through the SOCKS proxy.

pub mod config;
pub mod daemon;
pub mod logging;
pub mod relay;
pub mod tunnel;
