//! The public entry point: one remote connection and its shells.
//!
//! `TetherClient` serializes connects, routes every shell to either the SSH
//! channel loop or a mosh session, and exposes a synchronous `abort` that
//! interrupts whatever the connection is doing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tether_core::{
    ChannelId, ConnectionKey, FallbackReason, MoshBootstrapError, MoshConnectInfo, SessionConfig,
    ShellTransport, TetherError, TetherResult, TransportMode,
};
use tokio::task::JoinHandle;
use tokio::time;

use crate::connector::{Connector, SshConnector};
use crate::known_hosts::TrustStore;
use crate::mosh::{
    AcceleratedShell, MoshClientLauncher, MoshEndpoint, MoshLauncher, MoshNegotiator,
};
use crate::mux::ShellOutput;
use crate::session::Session;
use crate::socket::AbortSlot;

/// A shell returned by [`TetherClient::start_shell`].
#[derive(Debug)]
pub struct OpenedShell {
    pub id: ChannelId,
    /// Remote output; ends when the shell does.
    pub output: ShellOutput,
    pub transport: ShellTransport,
    /// Why mosh was not used, when it was requested.
    pub fallback_reason: Option<FallbackReason>,
}

#[derive(Clone)]
enum ShellRoute {
    Direct,
    Mosh(Arc<dyn AcceleratedShell>),
}

/// A live connection and everything attached to it.
struct Connection {
    key: ConnectionKey,
    session: Arc<Session>,
    negotiator: MoshNegotiator,
    timeouts: tether_core::Timeouts,
    shells: Mutex<HashMap<ChannelId, ShellRoute>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    fn new(config: &SessionConfig, session: Session) -> Self {
        Self {
            key: config.key(),
            session: Arc::new(session),
            negotiator: MoshNegotiator::new(config.mosh.clone()),
            timeouts: config.timeouts,
            shells: Mutex::new(HashMap::new()),
            keepalive: Mutex::new(None),
        }
    }

    /// Shell routes, minus shells that ended on their own since the last
    /// look.
    fn shells(&self) -> MutexGuard<'_, HashMap<ChannelId, ShellRoute>> {
        let mut shells = lock(&self.shells);
        for id in self.session.take_ended_shells() {
            if shells.remove(&id).is_some() {
                tracing::debug!("shell {} ended", id);
            }
        }
        shells.retain(|id, route| match route {
            ShellRoute::Direct => true,
            ShellRoute::Mosh(shell) if shell.is_running() => true,
            ShellRoute::Mosh(_) => {
                tracing::info!("mosh shell {} exited", id);
                false
            }
        });
        shells
    }

    /// Periodic keep-alive. A failed keep-alive severs the session.
    fn start_keepalive(&self) {
        let interval = self.timeouts.keepalive;
        if interval.is_zero() {
            return;
        }
        let session = self.session.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick

            loop {
                ticker.tick().await;
                if !session.is_active() {
                    break;
                }
                if let Err(e) = session.keepalive().await {
                    tracing::warn!("keepalive failed, dropping session: {}", e);
                    session.sever();
                    break;
                }
            }

            tracing::debug!("keepalive loop ended");
        });
        *lock(&self.keepalive) = Some(handle);
    }

    /// Stop every mosh session and forget all shells.
    fn stop_shells(&self) {
        let routes: Vec<ShellRoute> = self.shells().drain().map(|(_, route)| route).collect();
        for route in routes {
            if let ShellRoute::Mosh(shell) = route {
                shell.stop();
            }
        }
    }

    fn stop_keepalive(&self) {
        if let Some(handle) = lock(&self.keepalive).take() {
            handle.abort();
        }
    }

    async fn shutdown(&self) {
        self.stop_keepalive();
        self.stop_shells();
        self.session.disconnect().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop_keepalive();
    }
}

/// Steps of transport selection for one mosh shell.
enum MoshStage {
    Probe,
    Install,
    Bootstrap,
    Launch(MoshConnectInfo),
}

enum MoshOutcome {
    Running(Box<dyn AcceleratedShell>, ShellOutput),
    Fallback(FallbackReason),
}

/// Builder for a [`TetherClient`] with custom collaborators.
pub struct TetherClientBuilder {
    connector: Option<Arc<dyn Connector>>,
    launcher: Option<Arc<dyn MoshLauncher>>,
    trust_path: Option<PathBuf>,
}

impl TetherClientBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn MoshLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Trust store location for the default SSH connector.
    pub fn trust_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.trust_path = Some(path.into());
        self
    }

    pub fn build(self) -> TetherResult<TetherClient> {
        let connector = match self.connector {
            Some(connector) => connector,
            None => {
                let trust = match self.trust_path {
                    Some(path) => TrustStore::new(path),
                    None => TrustStore::default_location()?,
                };
                Arc::new(SshConnector::new(Arc::new(trust)))
            }
        };
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(MoshClientLauncher::default()));

        Ok(TetherClient::from_parts(connector, launcher))
    }
}

struct ClientInner {
    connector: Arc<dyn Connector>,
    launcher: Arc<dyn MoshLauncher>,
    abort: AbortSlot,
    /// Held for the duration of a connect attempt.
    connecting: tokio::sync::Mutex<()>,
    live: Mutex<Option<Arc<Connection>>>,
    next_shell_id: AtomicU32,
}

/// A single remote connection with any number of shells.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct TetherClient {
    inner: Arc<ClientInner>,
}

impl TetherClient {
    /// Client with the SSH connector and `mosh-client` launcher, trusting
    /// hosts recorded at `trust_path`.
    pub fn new(trust_path: impl Into<PathBuf>) -> Self {
        let trust = Arc::new(TrustStore::new(trust_path));
        Self::from_parts(
            Arc::new(SshConnector::new(trust)),
            Arc::new(MoshClientLauncher::default()),
        )
    }

    fn from_parts(connector: Arc<dyn Connector>, launcher: Arc<dyn MoshLauncher>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                connector,
                launcher,
                abort: AbortSlot::new(),
                connecting: tokio::sync::Mutex::new(()),
                live: Mutex::new(None),
                next_shell_id: AtomicU32::new(1),
            }),
        }
    }

    pub fn builder() -> TetherClientBuilder {
        TetherClientBuilder {
            connector: None,
            launcher: None,
            trust_path: None,
        }
    }

    /// Connect and authenticate.
    ///
    /// Connecting again with the same parameters while connected is a
    /// no-op; a concurrent duplicate waits for the first attempt and then
    /// shares its result. Different parameters fail with
    /// [`TetherError::AlreadyConnected`].
    pub async fn connect(&self, config: SessionConfig) -> TetherResult<()> {
        let key = config.key();
        let _attempt = self.inner.connecting.lock().await;

        let stale = {
            let mut live = lock(&self.inner.live);
            if let Some(conn) = live.as_ref() {
                if conn.session.is_active() && !self.inner.abort.is_aborted() {
                    if conn.key == key {
                        tracing::debug!("already connected to {}", key);
                        return Ok(());
                    }
                    tracing::warn!(
                        "refusing to connect to {} while connected to {}",
                        key,
                        conn.key
                    );
                    return Err(TetherError::AlreadyConnected);
                }
            }
            live.take()
        };
        if let Some(conn) = stale {
            conn.shutdown().await;
        }

        config.credentials.validate(config.auth)?;
        self.inner.abort.reset();

        let session = self.inner.connector.connect(&config, &self.inner.abort).await?;
        if self.inner.abort.is_aborted() {
            session.disconnect().await;
            return Err(TetherError::NotConnected);
        }

        let conn = Arc::new(Connection::new(&config, session));
        conn.start_keepalive();
        tracing::info!("connected to {} via {:?}", key, config.transport);
        *lock(&self.inner.live) = Some(conn);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_ok()
    }

    /// Identity of the live connection.
    pub fn connection_key(&self) -> Option<ConnectionKey> {
        self.connection().ok().map(|conn| conn.key.clone())
    }

    /// Ids of the shells currently routed by this client.
    pub fn open_shells(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = match self.connection() {
            Ok(conn) => conn.shells().keys().copied().collect(),
            Err(_) => Vec::new(),
        };
        ids.sort_unstable();
        ids
    }

    /// Start an interactive shell.
    ///
    /// With the mosh transport configured, a mosh session is attempted
    /// first; any failure falls back to a direct SSH shell and the reason is
    /// reported in [`OpenedShell::fallback_reason`].
    pub async fn start_shell(
        &self,
        cols: u16,
        rows: u16,
        startup_command: Option<&str>,
    ) -> TetherResult<OpenedShell> {
        let conn = self.connection()?;
        let id = self.inner.next_shell_id.fetch_add(1, Ordering::SeqCst);

        if conn.key.transport == TransportMode::Ssh {
            let output = self.open_direct(&conn, id, cols, rows, startup_command).await?;
            return Ok(OpenedShell {
                id,
                output,
                transport: ShellTransport::Direct,
                fallback_reason: None,
            });
        }

        match self.negotiate_mosh(&conn, cols, rows, startup_command).await {
            MoshOutcome::Running(shell, output) => {
                conn.shells().insert(id, ShellRoute::Mosh(Arc::from(shell)));
                tracing::info!("shell {} running over mosh", id);
                Ok(OpenedShell {
                    id,
                    output,
                    transport: ShellTransport::Mosh,
                    fallback_reason: None,
                })
            }
            MoshOutcome::Fallback(reason) => {
                tracing::warn!("mosh unavailable ({}), falling back to ssh", reason);
                let output = self.open_direct(&conn, id, cols, rows, startup_command).await?;
                Ok(OpenedShell {
                    id,
                    output,
                    transport: ShellTransport::MoshFallback,
                    fallback_reason: Some(reason),
                })
            }
        }
    }

    /// Send input to a shell.
    pub async fn write(&self, id: ChannelId, data: &[u8]) -> TetherResult<()> {
        let conn = self.connection()?;
        match route(&conn, id)? {
            ShellRoute::Direct => conn.session.write(id, data).await,
            ShellRoute::Mosh(shell) => shell.write(data).await,
        }
    }

    pub fn resize(&self, id: ChannelId, cols: u16, rows: u16) -> TetherResult<()> {
        let conn = self.connection()?;
        match route(&conn, id)? {
            ShellRoute::Direct => conn.session.resize(id, cols, rows),
            ShellRoute::Mosh(shell) => shell.resize(cols, rows),
        }
    }

    pub fn close_shell(&self, id: ChannelId) -> TetherResult<()> {
        let conn = self.connection()?;
        let removed = conn.shells().remove(&id);
        match removed {
            Some(ShellRoute::Direct) => conn.session.close_shell(id),
            Some(ShellRoute::Mosh(shell)) => {
                shell.stop();
                Ok(())
            }
            None => Err(TetherError::UnknownChannel(id)),
        }
    }

    /// Run a command with the configured exec timeout.
    pub async fn execute(&self, command: &str) -> TetherResult<String> {
        let conn = self.connection()?;
        conn.session.execute(command, conn.timeouts.exec).await
    }

    pub async fn execute_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> TetherResult<String> {
        let conn = self.connection()?;
        conn.session.execute(command, timeout).await
    }

    /// Close every shell and end the connection. Idempotent.
    pub async fn disconnect(&self) {
        let conn = lock(&self.inner.live).take();
        if let Some(conn) = conn {
            tracing::info!("disconnecting from {}", conn.key);
            conn.shutdown().await;
        }
    }

    /// Interrupt the connection immediately, including a connect in
    /// progress. Never blocks.
    ///
    /// Afterwards every operation fails with [`TetherError::NotConnected`]
    /// until the next `connect`.
    pub fn abort(&self) {
        self.inner.abort.abort();
        let conn = lock(&self.inner.live).clone();
        if let Some(conn) = conn {
            tracing::info!("aborting connection to {}", conn.key);
            conn.stop_keepalive();
            conn.stop_shells();
            conn.session.sever();
        }
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn connection(&self) -> TetherResult<Arc<Connection>> {
        if self.inner.abort.is_aborted() {
            return Err(TetherError::NotConnected);
        }
        match lock(&self.inner.live).as_ref() {
            Some(conn) if conn.session.is_active() => Ok(conn.clone()),
            _ => Err(TetherError::NotConnected),
        }
    }

    async fn open_direct(
        &self,
        conn: &Connection,
        id: ChannelId,
        cols: u16,
        rows: u16,
        startup_command: Option<&str>,
    ) -> TetherResult<ShellOutput> {
        // Routed before the channel exists so an immediate end is pruned.
        conn.shells().insert(id, ShellRoute::Direct);
        let output = match conn.session.open_shell(id, cols, rows).await {
            Ok(output) => output,
            Err(e) => {
                conn.shells().remove(&id);
                return Err(e);
            }
        };

        if let Some(command) = startup_command.map(str::trim).filter(|c| !c.is_empty()) {
            if let Err(e) = conn.session.write(id, format!("{command}\n").as_bytes()).await {
                tracing::warn!("startup command for shell {} failed: {}", id, e);
                conn.shells().remove(&id);
                if let Err(close_err) = conn.session.close_shell(id) {
                    tracing::debug!("close of shell {} after failed start: {}", id, close_err);
                }
                return Err(e);
            }
        }
        Ok(output)
    }

    async fn negotiate_mosh(
        &self,
        conn: &Connection,
        cols: u16,
        rows: u16,
        startup_command: Option<&str>,
    ) -> MoshOutcome {
        let negotiator = &conn.negotiator;
        let options = negotiator.options();
        let exec = conn.session.as_ref();
        let mut stage = MoshStage::Probe;

        loop {
            stage = match stage {
                MoshStage::Probe => {
                    if negotiator.is_server_available(exec).await {
                        MoshStage::Bootstrap
                    } else if options.install_server {
                        MoshStage::Install
                    } else {
                        return MoshOutcome::Fallback(FallbackReason::ServerMissing);
                    }
                }
                MoshStage::Install => match negotiator.install_server(exec).await {
                    Ok(()) => MoshStage::Bootstrap,
                    Err(e) => {
                        tracing::warn!("mosh-server install failed: {}", e);
                        return MoshOutcome::Fallback(FallbackReason::ServerMissing);
                    }
                },
                MoshStage::Bootstrap => {
                    let budget = options.bootstrap_timeout + options.bootstrap_grace;
                    let attempt = negotiator.bootstrap_connect_info(exec, startup_command);
                    match time::timeout(budget, attempt).await {
                        Ok(Ok(info)) => MoshStage::Launch(info),
                        Ok(Err(MoshBootstrapError::ServerMissing)) => {
                            return MoshOutcome::Fallback(FallbackReason::ServerMissing);
                        }
                        Ok(Err(e)) => {
                            tracing::warn!("mosh bootstrap failed: {}", e);
                            return MoshOutcome::Fallback(FallbackReason::BootstrapFailed);
                        }
                        Err(_) => {
                            tracing::warn!("mosh bootstrap exceeded {:?}", budget);
                            return MoshOutcome::Fallback(FallbackReason::BootstrapFailed);
                        }
                    }
                }
                MoshStage::Launch(info) => {
                    let host = conn
                        .session
                        .peer_ip()
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| conn.key.host.clone());
                    let endpoint = MoshEndpoint {
                        host,
                        port: info.port,
                        key: info.key,
                    };
                    return match self.inner.launcher.launch(&endpoint, cols, rows) {
                        Ok((shell, output)) => MoshOutcome::Running(shell, output),
                        Err(e) => {
                            tracing::warn!("mosh-client failed to start: {}", e);
                            MoshOutcome::Fallback(FallbackReason::SessionFailed)
                        }
                    };
                }
            };
        }
    }
}

fn route(conn: &Connection, id: ChannelId) -> TetherResult<ShellRoute> {
    conn.shells()
        .get(&id)
        .cloned()
        .ok_or(TetherError::UnknownChannel(id))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
