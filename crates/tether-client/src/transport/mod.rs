//! Native session implementations behind the `SessionBackend` seam.
//!
//! Only SSH is implemented; mosh sessions are launched separately by
//! [`crate::mosh::MoshLauncher`] and never go through this layer.

pub mod ssh;

pub use ssh::{HostKeyCheck, SshBackend, SshChannel};
