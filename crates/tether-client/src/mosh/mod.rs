//! Mosh acceleration: bootstrap over SSH, then hand off to `mosh-client`.

mod bootstrap;
mod client;

pub use bootstrap::{resolve_startup_command, MoshNegotiator};
pub use client::{AcceleratedShell, MoshClientLauncher, MoshEndpoint, MoshLauncher};

#[cfg(test)]
pub(crate) use bootstrap::PROBE_MARKER;

use std::time::Duration;

use tether_core::IoFuture;

/// Runs commands on the remote host.
///
/// The negotiator only needs command execution, so it depends on this seam
/// instead of a concrete session.
pub trait RemoteExec: Send + Sync {
    /// Run `command` and return its standard output.
    fn execute<'a>(&'a self, command: &'a str, timeout: Duration) -> IoFuture<'a, String>;
}
