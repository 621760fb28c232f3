//! CLI subcommand implementations.

pub mod connect;
pub mod exec;
pub mod known_hosts;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use dialoguer::Password;
use tether_client::{TetherClient, TetherError};
use tether_core::{ConnectionKey, Credentials, SessionConfig, TransportMode};
use tracing::{debug, info};

use crate::config::parse_target;

/// Connection settings after merging CLI flags over the config file.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub port: u16,
    pub default_user: Option<String>,
    pub identity: Option<PathBuf>,
    pub transport: TransportMode,
    pub install_mosh: bool,
    pub keepalive: Duration,
    pub trust_path: PathBuf,
}

impl ConnectOptions {
    /// Build the session config for `target`, prompting for secrets.
    pub fn session_config(&self, target: &str) -> Result<SessionConfig> {
        let (user, host) = parse_target(target, self.default_user.as_deref())?;

        let mut config = match &self.identity {
            Some(path) => SessionConfig::with_key(&host, self.port, &user, load_identity(path)?),
            None => {
                let password = Password::new()
                    .with_prompt(format!("{user}@{host}'s password"))
                    .allow_empty_password(true)
                    .interact()
                    .context("failed to read password")?;
                SessionConfig::with_password(&host, self.port, &user, password)
            }
        };

        config = config.transport(self.transport);
        config.timeouts.keepalive = self.keepalive;
        config.mosh.install_server = self.install_mosh;
        Ok(config)
    }

    /// Connect and authenticate a fresh client.
    pub async fn connect(&self, target: &str) -> Result<(TetherClient, ConnectionKey)> {
        let config = self.session_config(target)?;
        let key = config.key();
        info!(remote = %key, transport = ?config.transport, "connecting");

        let client = TetherClient::builder()
            .trust_store(&self.trust_path)
            .build()
            .context("failed to open trust store")?;

        if let Err(e) = client.connect(config).await {
            if let TetherError::HostKeyVerificationFailed { host, .. } = &e {
                eprintln!("WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED for {host}!");
                eprintln!(
                    "If the change is expected, run `tether known-hosts remove {} {}`.",
                    key.host, key.port
                );
            }
            return Err(e).with_context(|| format!("failed to connect to {key}"));
        }
        Ok((client, key))
    }
}

/// Read a private key and, when present next to it, its `.pub` file.
fn load_identity(path: &Path) -> Result<Credentials> {
    let private_key = std::fs::read(path)
        .with_context(|| format!("failed to read identity {}", path.display()))?;
    let mut credentials = Credentials::key(private_key.clone());

    let mut pub_path = path.as_os_str().to_owned();
    pub_path.push(".pub");
    let pub_path = PathBuf::from(pub_path);
    if pub_path.exists() {
        debug!(path = %pub_path.display(), "using public key");
        let public_key = std::fs::read(&pub_path)
            .with_context(|| format!("failed to read {}", pub_path.display()))?;
        credentials = credentials.with_public_key(public_key);
    }

    if tether_client::auth::requires_passphrase(&private_key) {
        let passphrase = Password::new()
            .with_prompt(format!("Enter passphrase for key '{}'", path.display()))
            .interact()
            .context("failed to read passphrase")?;
        credentials = credentials.with_passphrase(passphrase);
    }
    Ok(credentials)
}
