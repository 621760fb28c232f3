//! One authenticated remote session.
//!
//! A `Session` owns the native backend, the socket guard used to sever it,
//! and the channel loop. All shells and execs of the session go through it.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tether_core::{ChannelId, IoFuture, SessionBackend, TetherError, TetherResult};
use tokio::time;

use crate::mosh::RemoteExec;
use crate::mux::{Multiplexer, ShellOutput};
use crate::socket::SocketGuard;

/// Upper bound on the native teardown during disconnect.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Session {
    backend: Arc<dyn SessionBackend>,
    socket: Option<Arc<SocketGuard>>,
    peer_ip: Option<IpAddr>,
    mux: Multiplexer,
    active: Arc<AtomicBool>,
    released: AtomicBool,
}

impl Session {
    /// Wrap an authenticated backend.
    ///
    /// `socket` is the guard over the connection's TCP socket, if there is
    /// one; closing it interrupts any in-flight native call.
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        socket: Option<Arc<SocketGuard>>,
        peer_ip: Option<IpAddr>,
    ) -> Self {
        let active = Arc::new(AtomicBool::new(true));
        Self {
            mux: Multiplexer::new(backend.clone(), active.clone()),
            backend,
            socket,
            peer_ip,
            active,
            released: AtomicBool::new(false),
        }
    }

    /// Whether the session is usable. A session whose transport was
    /// closed by the remote end is severed here and reports false.
    pub fn is_active(&self) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        if self.backend.is_closed() {
            tracing::info!("session closed by remote");
            self.sever();
            return false;
        }
        true
    }

    /// Resolved address of the remote end, when known.
    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.peer_ip
    }

    /// Open an interactive shell and register it under `id`.
    pub async fn open_shell(
        &self,
        id: ChannelId,
        cols: u16,
        rows: u16,
    ) -> TetherResult<ShellOutput> {
        self.ensure_active()?;
        let io = self.backend.open_shell(cols, rows).await?;
        tracing::info!("shell {} opened ({}x{})", id, cols, rows);
        self.mux.add_shell(id, io)
    }

    pub async fn write(&self, id: ChannelId, data: &[u8]) -> TetherResult<()> {
        self.ensure_active()?;
        self.mux.write(id, data.to_vec()).await
    }

    /// Request a terminal size change. Applied asynchronously.
    pub fn resize(&self, id: ChannelId, cols: u16, rows: u16) -> TetherResult<()> {
        self.ensure_active()?;
        self.mux.resize(id, cols, rows)
    }

    pub fn close_shell(&self, id: ChannelId) -> TetherResult<()> {
        self.ensure_active()?;
        self.mux.close(id)
    }

    /// Shells the loop dropped since the last call because their channel
    /// reached end of stream, failed, or was closed.
    pub fn take_ended_shells(&self) -> Vec<ChannelId> {
        self.mux.take_ended()
    }

    /// Run `command` and collect its standard output.
    ///
    /// On timeout the request is abandoned and its channel closed.
    pub async fn execute(&self, command: &str, timeout: Duration) -> TetherResult<String> {
        self.ensure_active()?;
        let pending = self.mux.exec(command.to_string())?;
        match time::timeout(timeout, pending).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TetherError::NotConnected),
            Err(_) => {
                tracing::debug!("exec timed out after {:?}: {}", timeout, command);
                Err(TetherError::Timeout)
            }
        }
    }

    pub async fn keepalive(&self) -> TetherResult<()> {
        self.ensure_active()?;
        self.backend.keepalive().await
    }

    /// Mark the session dead and close its socket without waiting.
    ///
    /// In-flight operations fail promptly; the native session is released
    /// by a later [`Session::disconnect`].
    pub fn sever(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(socket) = &self.socket {
            socket.close();
        }
        self.mux.shutdown();
    }

    /// Tear the session down. Safe to call any number of times and
    /// concurrently; the native session is released once.
    pub async fn disconnect(&self) {
        self.sever();
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        match time::timeout(RELEASE_TIMEOUT, self.backend.disconnect()).await {
            Ok(Ok(())) => tracing::info!("session disconnected"),
            Ok(Err(e)) => tracing::debug!("disconnect after close: {}", e),
            Err(_) => tracing::debug!("native disconnect timed out"),
        }
    }

    fn ensure_active(&self) -> TetherResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(TetherError::NotConnected)
        }
    }
}

impl RemoteExec for Session {
    fn execute<'a>(&'a self, command: &'a str, timeout: Duration) -> IoFuture<'a, String> {
        Box::pin(Session::execute(self, command, timeout))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer_ip", &self.peer_ip)
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, FakeChannel, ScriptedExec};
    use tether_core::ReadOutcome;

    fn session(backend: Arc<FakeBackend>) -> Session {
        Session::new(backend, None, None)
    }

    #[tokio::test]
    async fn shell_round_trip() {
        let backend = Arc::new(FakeBackend::new());
        let channel = FakeChannel::new();
        backend.queue_shell(channel.clone());
        let session = session(backend.clone());

        let mut output = session.open_shell(1, 80, 24).await.unwrap();
        assert_eq!(backend.shell_sizes(), vec![(80, 24)]);

        session.write(1, b"whoami\n").await.unwrap();
        assert_eq!(channel.written(), b"whoami\n");

        channel.push_data(b"root\n");
        channel.push(ReadOutcome::Eof);
        assert_eq!(output.recv().await.unwrap(), b"root\n");
        assert!(output.recv().await.is_none());
    }

    #[tokio::test]
    async fn shell_open_failure_propagates() {
        let backend = Arc::new(FakeBackend::new());
        backend.fail_shells(TetherError::ShellRequestFailed);
        let session = session(backend);
        assert!(matches!(
            session.open_shell(1, 80, 24).await,
            Err(TetherError::ShellRequestFailed)
        ));
    }

    #[tokio::test]
    async fn execute_times_out() {
        let backend = Arc::new(FakeBackend::new());
        backend.script("sleep", ScriptedExec::Hang);
        let session = session(backend);
        let err = session
            .execute("sleep 60", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::Timeout));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let backend = Arc::new(FakeBackend::new());
        let session = session(backend.clone());

        session.disconnect().await;
        session.disconnect().await;
        assert!(!session.is_active());
        assert_eq!(backend.disconnects(), 1);
    }

    #[tokio::test]
    async fn concurrent_disconnects_release_once() {
        let backend = Arc::new(FakeBackend::new());
        let session = Arc::new(session(backend.clone()));

        let a = tokio::spawn({
            let session = session.clone();
            async move { session.disconnect().await }
        });
        let b = tokio::spawn({
            let session = session.clone();
            async move { session.disconnect().await }
        });
        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(backend.disconnects(), 1);
    }

    #[tokio::test]
    async fn operations_after_sever_fail() {
        let backend = Arc::new(FakeBackend::new());
        let session = session(backend);
        session.sever();

        assert!(matches!(
            session.execute("true", Duration::from_secs(1)).await,
            Err(TetherError::NotConnected)
        ));
        assert!(matches!(session.write(1, b"x").await, Err(TetherError::NotConnected)));
        assert!(matches!(session.resize(1, 80, 24), Err(TetherError::NotConnected)));
        assert!(matches!(session.keepalive().await, Err(TetherError::NotConnected)));
    }

    #[tokio::test]
    async fn remote_close_deactivates_session() {
        let backend = Arc::new(FakeBackend::new());
        let session = session(backend.clone());
        assert!(session.is_active());

        backend.close_remote();
        assert!(!session.is_active());
        assert!(matches!(
            session.open_shell(1, 80, 24).await,
            Err(TetherError::NotConnected)
        ));
        assert!(backend.shell_sizes().is_empty());
    }

    #[tokio::test]
    async fn ended_shells_are_reported_once() {
        let backend = Arc::new(FakeBackend::new());
        let channel = FakeChannel::new();
        backend.queue_shell(channel.clone());
        let session = session(backend);

        let mut output = session.open_shell(4, 80, 24).await.unwrap();
        channel.push(ReadOutcome::Eof);
        assert!(output.recv().await.is_none());

        assert_eq!(session.take_ended_shells(), vec![4]);
        assert!(session.take_ended_shells().is_empty());
    }
}
