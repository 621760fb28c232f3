//! SSH transport on top of `russh`.
//!
//! `HostKeyCheck` delegates host identity to the [`TrustStore`] during the
//! handshake, `SshBackend` opens channels on an authenticated handle, and
//! `SshChannel` adapts a russh channel to the non-blocking [`ChannelIo`]
//! contract the I/O loop expects.

use std::sync::Arc;

use futures_util::FutureExt;
use russh::client::{self, Handle};
use russh::keys::PublicKey;
use russh::{ChannelMsg, Disconnect};
use tether_core::{
    fingerprint, ChannelIo, IoFuture, ReadOutcome, ReadyFuture, SessionBackend, TetherError,
};

use crate::known_hosts::TrustStore;

/// Terminal type requested for interactive shells.
const TERM: &str = "xterm-256color";

/// Error type threaded through the russh handshake.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// Protocol or socket failure inside russh.
    #[error("ssh: {0}")]
    Ssh(#[from] russh::Error),
    /// The trust store refused the server's identity.
    #[error(transparent)]
    Rejected(TetherError),
}

impl From<HandshakeError> for TetherError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::Rejected(err) => err,
            HandshakeError::Ssh(err) => TetherError::ConnectionFailed(err.to_string()),
        }
    }
}

/// russh handler that verifies the server key against the trust store.
///
/// Lookups use the advertised endpoint, not the dialed one, so tunneled
/// connections share trust with direct ones.
pub struct HostKeyCheck {
    host: String,
    port: u16,
    trust: Arc<TrustStore>,
}

impl HostKeyCheck {
    pub fn new(host: impl Into<String>, port: u16, trust: Arc<TrustStore>) -> Self {
        Self {
            host: host.into(),
            port,
            trust,
        }
    }
}

impl client::Handler for HostKeyCheck {
    type Error = HandshakeError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let blob = server_public_key.to_bytes().map_err(|e| {
            HandshakeError::Rejected(TetherError::ConnectionFailed(format!(
                "cannot encode server key: {e}"
            )))
        })?;
        let fp = fingerprint(&blob);
        let key_type = server_public_key.algorithm().as_str().to_string();

        self.trust
            .verify(&self.host, self.port, &fp, &key_type)
            .map_err(HandshakeError::Rejected)?;
        Ok(true)
    }
}

/// An authenticated SSH connection.
pub struct SshBackend {
    handle: Arc<Handle<HostKeyCheck>>,
}

impl SshBackend {
    pub fn new(handle: Handle<HostKeyCheck>) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }
}

impl SessionBackend for SshBackend {
    fn open_shell(&self, cols: u16, rows: u16) -> IoFuture<'static, Box<dyn ChannelIo>> {
        let handle = self.handle.clone();
        Box::pin(async move {
            let channel = handle.channel_open_session().await.map_err(|e| {
                tracing::debug!(error = %e, "session channel open failed");
                TetherError::ChannelOpenFailed
            })?;
            channel
                .request_pty(false, TERM, u32::from(cols), u32::from(rows), 0, 0, &[])
                .await
                .map_err(|e| {
                    tracing::debug!(error = %e, "pty request failed");
                    TetherError::ShellRequestFailed
                })?;
            channel.request_shell(false).await.map_err(|e| {
                tracing::debug!(error = %e, "shell request failed");
                TetherError::ShellRequestFailed
            })?;
            Ok(Box::new(SshChannel::new(channel, true)) as Box<dyn ChannelIo>)
        })
    }

    fn open_exec(&self, command: String) -> IoFuture<'static, Box<dyn ChannelIo>> {
        let handle = self.handle.clone();
        Box::pin(async move {
            let channel = handle.channel_open_session().await.map_err(|e| {
                tracing::debug!(error = %e, "exec channel open failed");
                TetherError::ChannelOpenFailed
            })?;
            channel
                .exec(true, command.as_bytes())
                .await
                .map_err(|e| TetherError::Socket(format!("exec request failed: {e}")))?;
            Ok(Box::new(SshChannel::new(channel, false)) as Box<dyn ChannelIo>)
        })
    }

    fn keepalive(&self) -> IoFuture<'static, ()> {
        let handle = self.handle.clone();
        Box::pin(async move {
            handle
                .send_keepalive(true)
                .await
                .map_err(|e| TetherError::Socket(e.to_string()))
        })
    }

    fn disconnect(&self) -> IoFuture<'static, ()> {
        let handle = self.handle.clone();
        Box::pin(async move {
            handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .map_err(|e| TetherError::Socket(e.to_string()))
        })
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

/// A russh channel driven through non-blocking reads.
pub struct SshChannel {
    channel: russh::Channel<client::Msg>,
    /// Deliver stderr alongside stdout (shells) or drop it (exec).
    merge_stderr: bool,
    /// Message taken off the channel by `readable` and not yet consumed.
    /// `Some(None)` means the channel's queue has ended.
    parked: Option<Option<ChannelMsg>>,
}

impl SshChannel {
    pub fn new(channel: russh::Channel<client::Msg>, merge_stderr: bool) -> Self {
        Self {
            channel,
            merge_stderr,
            parked: None,
        }
    }

    fn next_message(&mut self) -> Option<Option<ChannelMsg>> {
        // `wait` only pulls from the channel's queue, so dropping it
        // unresolved loses nothing.
        self.parked
            .take()
            .or_else(|| self.channel.wait().now_or_never())
    }
}

/// Map one channel message to a read result. `None` means the message
/// carries nothing for the reader and the next one should be tried.
fn classify(msg: Option<ChannelMsg>, merge_stderr: bool) -> Option<ReadOutcome> {
    match msg {
        Some(ChannelMsg::Data { data }) => Some(ReadOutcome::Data(data.to_vec())),
        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
            if merge_stderr {
                Some(ReadOutcome::Data(data.to_vec()))
            } else {
                tracing::trace!(len = data.len(), "discarding exec stderr");
                None
            }
        }
        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => Some(ReadOutcome::Eof),
        Some(ChannelMsg::ExitStatus { exit_status }) => {
            tracing::debug!(exit_status, "remote process exited");
            None
        }
        Some(ChannelMsg::Failure) => Some(ReadOutcome::Failed("channel request failed".into())),
        Some(_) => None,
    }
}

impl ChannelIo for SshChannel {
    fn try_read(&mut self) -> ReadOutcome {
        loop {
            let Some(msg) = self.next_message() else {
                return ReadOutcome::WouldBlock;
            };
            if let Some(outcome) = classify(msg, self.merge_stderr) {
                return outcome;
            }
        }
    }

    fn readable(&mut self) -> ReadyFuture<'_> {
        Box::pin(async move {
            if self.parked.is_none() {
                let msg = self.channel.wait().await;
                self.parked = Some(msg);
            }
        })
    }

    fn write_all<'a>(&'a mut self, data: &'a [u8]) -> IoFuture<'a, ()> {
        Box::pin(async move {
            self.channel
                .data(data)
                .await
                .map_err(|e| TetherError::Socket(format!("channel write failed: {e}")))
        })
    }

    fn resize(&mut self, cols: u16, rows: u16) -> IoFuture<'_, ()> {
        Box::pin(async move {
            self.channel
                .window_change(u32::from(cols), u32::from(rows), 0, 0)
                .await
                .map_err(|e| TetherError::Socket(format!("window change failed: {e}")))
        })
    }

    fn close(self: Box<Self>) -> IoFuture<'static, ()> {
        Box::pin(async move {
            let _ = self.channel.eof().await;
            self.channel
                .close()
                .await
                .map_err(|e| TetherError::Socket(format!("channel close failed: {e}")))
        })
    }
}
