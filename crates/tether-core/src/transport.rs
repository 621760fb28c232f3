//! Transport vocabulary and the abstract native-session seam.
//!
//! The engine drives channels through [`ChannelIo`] and opens them through
//! [`SessionBackend`]; the SSH implementation lives in `tether-client`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::error::TetherResult;

/// Identifier of a shell opened through the client.
pub type ChannelId = u32;

/// Transport configured for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Shells run directly on the SSH session.
    #[default]
    Ssh,
    /// Shells are upgraded to mosh when the server supports it.
    Mosh,
}

/// Transport that actually carries an opened shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellTransport {
    /// A channel on the SSH session.
    Direct,
    /// An independent mosh (UDP) session.
    Mosh,
    /// Mosh was requested but the shell fell back to a direct channel.
    MoshFallback,
}

/// Why a mosh shell fell back to the direct transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// `mosh-server` is not available on the remote host.
    ServerMissing,
    /// `mosh-server` ran but its connect banner could not be obtained.
    BootstrapFailed,
    /// The local mosh client session could not be started.
    SessionFailed,
}

impl fmt::Display for ShellTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("ssh"),
            Self::Mosh => f.write_str("mosh"),
            Self::MoshFallback => f.write_str("ssh (mosh fallback)"),
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerMissing => f.write_str("mosh-server not found on remote host"),
            Self::BootstrapFailed => f.write_str("mosh-server failed to start"),
            Self::SessionFailed => f.write_str("mosh client session failed"),
        }
    }
}

/// Boxed future returned by the object-safe session traits.
pub type IoFuture<'a, T> = Pin<Box<dyn Future<Output = TetherResult<T>> + Send + 'a>>;

/// Resolves once a channel may have something to read.
pub type ReadyFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Result of one non-blocking read attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were available.
    Data(Vec<u8>),
    /// Nothing buffered right now.
    WouldBlock,
    /// The remote end finished the stream.
    Eof,
    /// The channel failed.
    Failed(String),
}

/// One open channel on a native session.
pub trait ChannelIo: Send {
    /// Attempt a read without waiting.
    fn try_read(&mut self) -> ReadOutcome;

    /// Wait until `try_read` can make progress.
    ///
    /// The loop drops this future whenever something else wakes it first,
    /// so implementations must not lose data when cancelled.
    fn readable(&mut self) -> ReadyFuture<'_>;

    /// Write all bytes, waiting out flow control as needed.
    fn write_all<'a>(&'a mut self, data: &'a [u8]) -> IoFuture<'a, ()>;

    /// Request a PTY size change.
    fn resize(&mut self, cols: u16, rows: u16) -> IoFuture<'_, ()>;

    /// Close the channel.
    fn close(self: Box<Self>) -> IoFuture<'static, ()>;
}

/// An authenticated native session that can open channels.
///
/// Returned futures are `'static` so the I/O loop can hold them across
/// iterations while an open is in flight.
pub trait SessionBackend: Send + Sync {
    /// Open a channel, request a PTY of the given size, and start a shell.
    fn open_shell(&self, cols: u16, rows: u16) -> IoFuture<'static, Box<dyn ChannelIo>>;

    /// Open a channel and start `command` on it.
    fn open_exec(&self, command: String) -> IoFuture<'static, Box<dyn ChannelIo>>;

    /// Send a protocol-level keep-alive.
    fn keepalive(&self) -> IoFuture<'static, ()>;

    /// Politely end the session.
    fn disconnect(&self) -> IoFuture<'static, ()>;

    /// Whether the underlying connection is gone.
    fn is_closed(&self) -> bool;
}
