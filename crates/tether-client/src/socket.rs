//! Raw socket lifecycle: dialing, tuning, and cross-task abort.
//!
//! The SSH session runs over a tokio stream, but the connector keeps a
//! duplicated descriptor in a [`SocketGuard`] so any thread can sever the
//! connection without waiting on the task that owns the session.

use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::SockRef;
use tether_core::{TetherError, TetherResult};

/// Send buffer is kept small so keystrokes are not queued behind bulk data.
const SEND_BUFFER_SIZE: usize = 32 * 1024;
/// Receive buffer is large to absorb bursts of command output.
const RECV_BUFFER_SIZE: usize = 256 * 1024;

/// Resolve `host:port` and connect to the first candidate that accepts.
///
/// Blocking; call from `spawn_blocking`. Both address families are tried in
/// resolver order.
pub fn dial(host: &str, port: u16, timeout: Duration) -> TetherResult<TcpStream> {
    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| TetherError::ConnectionFailed(format!("cannot resolve {host}: {e}")))?
        .collect();

    if candidates.is_empty() {
        return Err(TetherError::ConnectionFailed(format!(
            "{host} resolved to no addresses"
        )));
    }

    let mut last_err: Option<io::Error> = None;
    for addr in &candidates {
        match TcpStream::connect_timeout(addr, timeout) {
            Ok(stream) => {
                tracing::debug!(%addr, "socket connected");
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(TetherError::ConnectionFailed(format!(
        "{host}:{port}: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Tune a freshly connected socket for interactive traffic.
pub fn tune(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    sock.set_send_buffer_size(SEND_BUFFER_SIZE)?;
    sock.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
    // Linux uses MSG_NOSIGNAL and the Rust runtime ignores SIGPIPE; Apple
    // platforms need the per-socket option.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    sock.set_nosigpipe(true)?;
    Ok(())
}

/// Numeric address of the connected peer, if the OS still reports one.
pub fn peer_ip(stream: &TcpStream) -> Option<IpAddr> {
    stream.peer_addr().ok().map(|addr| addr.ip())
}

/// Closable handle to a session's socket. Its only operation is take-and-close.
#[derive(Debug)]
pub struct SocketGuard {
    inner: Mutex<Option<TcpStream>>,
}

impl SocketGuard {
    /// Wrap a duplicate of the session's socket.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            inner: Mutex::new(Some(stream)),
        }
    }

    /// Shut the socket down in both directions and drop the duplicate.
    ///
    /// Returns `true` if this call performed the close. Safe from any thread.
    pub fn close(&self) -> bool {
        let taken = match self.inner.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match taken {
            Some(stream) => {
                if let Err(e) = stream.shutdown(Shutdown::Both) {
                    tracing::debug!(error = %e, "socket shutdown failed");
                }
                true
            }
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self.inner.lock() {
            Ok(slot) => slot.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

/// Abort plumbing shared between the client and an in-flight connect.
///
/// The connector arms the slot as soon as a socket exists, so an abort that
/// lands mid-handshake still severs the half-open connection.
#[derive(Debug, Default)]
pub struct AbortSlot {
    guard: Mutex<Option<Arc<SocketGuard>>>,
    aborted: AtomicBool,
}

impl AbortSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the socket of the connection being established.
    ///
    /// Fails with `NotConnected` (closing the socket) if an abort already
    /// happened.
    pub fn arm(&self, guard: Arc<SocketGuard>) -> TetherResult<()> {
        let mut slot = match self.guard.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.aborted.load(Ordering::SeqCst) {
            guard.close();
            return Err(TetherError::NotConnected);
        }
        *slot = Some(guard);
        Ok(())
    }

    /// Sever whatever socket is armed. Never blocks on I/O.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        let guard = match self.guard.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(guard) = guard {
            if guard.close() {
                tracing::info!("socket severed by abort");
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Clear a previous abort before a fresh connect.
    pub fn reset(&self) {
        let mut slot = match self.guard.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = None;
        self.aborted.store(false, Ordering::SeqCst);
    }
}
