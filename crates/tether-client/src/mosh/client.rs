//! Local side of mosh: running `mosh-client` against a bootstrapped server.
//!
//! The launcher is a seam so the client façade can be tested without a real
//! `mosh-client` binary. The default implementation runs it in a local PTY.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tether_core::{IoFuture, TetherError, TetherResult};
use tokio::sync::mpsc;

use crate::mux::ShellOutput;

/// Where a bootstrapped `mosh-server` is listening.
#[derive(Clone, PartialEq, Eq)]
pub struct MoshEndpoint {
    /// Remote address, preferably the resolved IP of the SSH peer.
    pub host: String,
    pub port: u16,
    /// 22-character session key announced by the server.
    pub key: String,
}

impl std::fmt::Debug for MoshEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoshEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// A running mosh session standing in for an SSH shell.
pub trait AcceleratedShell: Send + Sync {
    fn write<'a>(&'a self, data: &'a [u8]) -> IoFuture<'a, ()>;
    fn resize(&self, cols: u16, rows: u16) -> TetherResult<()>;
    /// Terminate the session. Idempotent.
    fn stop(&self);
    /// Whether the session is still alive. False once stopped or once the
    /// client exited on its own.
    fn is_running(&self) -> bool;
}

/// Starts mosh sessions.
pub trait MoshLauncher: Send + Sync {
    fn launch(
        &self,
        endpoint: &MoshEndpoint,
        cols: u16,
        rows: u16,
    ) -> TetherResult<(Box<dyn AcceleratedShell>, ShellOutput)>;
}

/// Runs the local `mosh-client` binary in a pseudo-terminal.
#[derive(Debug, Clone)]
pub struct MoshClientLauncher {
    program: String,
}

impl MoshClientLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for MoshClientLauncher {
    fn default() -> Self {
        Self::new("mosh-client")
    }
}

impl MoshLauncher for MoshClientLauncher {
    fn launch(
        &self,
        endpoint: &MoshEndpoint,
        cols: u16,
        rows: u16,
    ) -> TetherResult<(Box<dyn AcceleratedShell>, ShellOutput)> {
        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .map_err(|e| TetherError::MoshSessionFailed(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&self.program);
        cmd.arg(&endpoint.host);
        cmd.arg(endpoint.port.to_string());
        cmd.env("MOSH_KEY", &endpoint.key);
        cmd.env("TERM", "xterm-256color");

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            TetherError::MoshSessionFailed(format!("failed to start {}: {e}", self.program))
        })?;
        // The child holds its own copy of the slave side.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| {
                TetherError::MoshSessionFailed(format!("failed to clone PTY reader: {e}"))
            })?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| {
                TetherError::MoshSessionFailed(format!("failed to take PTY writer: {e}"))
            })?;

        tracing::info!(
            "mosh-client started for {}:{} ({}x{})",
            endpoint.host,
            endpoint.port,
            cols,
            rows
        );

        let (sink, output) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || pump_output(reader, sink));

        let shell = MoshClientShell {
            writer: Arc::new(Mutex::new(writer)),
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
        };
        Ok((Box::new(shell), output))
    }
}

/// Copy PTY output to the consumer until the child goes away.
fn pump_output(mut reader: Box<dyn Read + Send>, sink: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if sink.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("mosh-client output ended: {}", e);
                break;
            }
        }
    }
    tracing::debug!("mosh-client output pump finished");
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

struct MoshClientShell {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
}

impl AcceleratedShell for MoshClientShell {
    fn write<'a>(&'a self, data: &'a [u8]) -> IoFuture<'a, ()> {
        let writer = self.writer.clone();
        let data = data.to_vec();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || -> TetherResult<()> {
                let mut writer = writer.lock().map_err(|_| {
                    TetherError::MoshSessionFailed("PTY writer lock poisoned".into())
                })?;
                writer.write_all(&data)?;
                writer.flush()?;
                Ok(())
            })
            .await
            .map_err(|e| TetherError::Unknown(format!("join error: {e}")))?
        })
    }

    fn resize(&self, cols: u16, rows: u16) -> TetherResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| TetherError::MoshSessionFailed("PTY master lock poisoned".into()))?;
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| TetherError::MoshSessionFailed(format!("PTY resize failed: {e}")))?;
        tracing::debug!("mosh pty resized to {}x{}", cols, rows);
        Ok(())
    }

    fn stop(&self) {
        let mut child = match self.child.lock() {
            Ok(child) => child,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        match child.kill() {
            Ok(()) => tracing::info!("mosh-client stopped"),
            Err(e) => tracing::debug!("mosh-client kill: {}", e),
        }
    }

    fn is_running(&self) -> bool {
        let mut child = match self.child.lock() {
            Ok(child) => child,
            Err(poisoned) => poisoned.into_inner(),
        };
        !matches!(child.try_wait(), Ok(Some(_)))
    }
}

impl Drop for MoshClientShell {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_debug_hides_key() {
        let endpoint = MoshEndpoint {
            host: "10.0.0.5".into(),
            port: 60001,
            key: "ABCDEFGHIJKLMNOPQRSTUV".into(),
        };
        let shown = format!("{endpoint:?}");
        assert!(shown.contains("60001"));
        assert!(!shown.contains("ABCDEFGHIJKLMNOPQRSTUV"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_session_failure() {
        let launcher = MoshClientLauncher::new("/nonexistent/tether-mosh-client");
        let endpoint = MoshEndpoint {
            host: "127.0.0.1".into(),
            port: 60001,
            key: "ABCDEFGHIJKLMNOPQRSTUV".into(),
        };
        match launcher.launch(&endpoint, 80, 24) {
            Err(TetherError::MoshSessionFailed(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("launch should fail"),
        }
    }
}
