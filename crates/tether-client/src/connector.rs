//! Establishing authenticated sessions.
//!
//! The [`Connector`] seam lets the client façade be driven by a fake in
//! tests; [`SshConnector`] is the real implementation: TCP dial, socket
//! tuning, SSH handshake with host-key verification, then authentication.

use std::sync::Arc;

use russh::client;
use tether_core::{IoFuture, SessionConfig, TetherError, TetherResult};
use tokio::time;

use crate::auth;
use crate::known_hosts::TrustStore;
use crate::session::Session;
use crate::socket::{self, AbortSlot, SocketGuard};
use crate::transport::{HostKeyCheck, SshBackend};

/// Produces authenticated sessions.
pub trait Connector: Send + Sync {
    /// Connect and authenticate.
    ///
    /// The connector must arm `abort` with its socket as soon as one exists
    /// so an abort can interrupt the handshake.
    fn connect<'a>(
        &'a self,
        config: &'a SessionConfig,
        abort: &'a AbortSlot,
    ) -> IoFuture<'a, Session>;
}

/// Connects over SSH and verifies host keys against a [`TrustStore`].
pub struct SshConnector {
    trust: Arc<TrustStore>,
}

impl SshConnector {
    pub fn new(trust: Arc<TrustStore>) -> Self {
        Self { trust }
    }

    async fn establish(&self, config: &SessionConfig, abort: &AbortSlot) -> TetherResult<Session> {
        let dial_host = config.dial_host().to_string();
        let dial_port = config.dial_port();
        let connect_timeout = config.timeouts.connect;

        tracing::info!(
            "connecting to {} (dial {}:{})",
            config.advertised(),
            dial_host,
            dial_port
        );

        let stream = tokio::task::spawn_blocking(move || -> TetherResult<std::net::TcpStream> {
            let stream = socket::dial(&dial_host, dial_port, connect_timeout)?;
            socket::tune(&stream)?;
            Ok(stream)
        })
        .await
        .map_err(|e| TetherError::Unknown(format!("dial task failed: {e}")))??;

        let guard = Arc::new(SocketGuard::new(stream.try_clone()?));
        abort.arm(guard.clone())?;

        match self.handshake(config, stream).await {
            Ok((handle, peer_ip)) => {
                let backend = Arc::new(SshBackend::new(handle));
                Ok(Session::new(backend, Some(guard), peer_ip))
            }
            Err(e) => {
                guard.close();
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        config: &SessionConfig,
        stream: std::net::TcpStream,
    ) -> TetherResult<(client::Handle<HostKeyCheck>, Option<std::net::IpAddr>)> {
        let peer_ip = socket::peer_ip(&stream);
        stream.set_nonblocking(true)?;
        let stream = tokio::net::TcpStream::from_std(stream)?;

        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..Default::default()
        });
        let checker = HostKeyCheck::new(config.host.clone(), config.port, self.trust.clone());

        let mut handle = match time::timeout(
            config.timeouts.connect,
            client::connect_stream(ssh_config, stream, checker),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TetherError::Timeout),
        };
        tracing::debug!("handshake with {} complete", config.advertised());

        auth::authenticate(&mut handle, &config.username, config.auth, &config.credentials).await?;
        Ok((handle, peer_ip))
    }
}

impl Connector for SshConnector {
    fn connect<'a>(
        &'a self,
        config: &'a SessionConfig,
        abort: &'a AbortSlot,
    ) -> IoFuture<'a, Session> {
        Box::pin(self.establish(config, abort))
    }
}
