//! tether-client: remote shell engine over SSH with optional mosh.
//!
//! Connects and authenticates over SSH with trust-on-first-use host keys,
//! multiplexes interactive shells and one-shot commands over one session,
//! and can hand shells off to `mosh-client` after bootstrapping
//! `mosh-server` on the remote host.
//!
//! # Quick Start
//!
//! ```no_run
//! use tether_client::TetherClient;
//! use tether_core::SessionConfig;
//!
//! # async fn example() -> tether_core::TetherResult<()> {
//! let client = TetherClient::builder().build()?;
//! client
//!     .connect(SessionConfig::with_password("example.com", 22, "alice", "secret"))
//!     .await?;
//!
//! let mut shell = client.start_shell(80, 24, None).await?;
//! client.write(shell.id, b"echo hello\n").await?;
//! if let Some(chunk) = shell.output.recv().await {
//!     println!("{}", String::from_utf8_lossy(&chunk));
//! }
//!
//! println!("{}", client.execute("uname -a").await?);
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod connector;
pub mod known_hosts;
pub mod mosh;
pub mod mux;
pub mod session;
pub mod socket;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export primary public types.
pub use client::{OpenedShell, TetherClient, TetherClientBuilder};
pub use connector::{Connector, SshConnector};
pub use known_hosts::{HostKeyEntry, HostStatus, TrustStore};
pub use mosh::{
    AcceleratedShell, MoshClientLauncher, MoshEndpoint, MoshLauncher, MoshNegotiator, RemoteExec,
};
pub use mux::ShellOutput;
pub use session::Session;
pub use socket::AbortSlot;

// Re-export tether-core error types for convenience.
pub use tether_core::{TetherError, TetherResult};
