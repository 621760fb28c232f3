//! Session configuration and connection identity.
//!
//! `SessionConfig` separates the *advertised* endpoint (used for host-key
//! lookups and protocol banners) from the *dial* endpoint (the actual socket
//! target, which differs when the connection is tunneled). Trust decisions
//! are always keyed on the advertised endpoint.

use std::fmt;
use std::time::Duration;

use crate::error::{TetherError, TetherResult};
use crate::transport::TransportMode;

/// How the client authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// Password, with keyboard-interactive fallback using the same password.
    Password,
    /// Unencrypted private key.
    Key,
    /// Private key protected by a passphrase.
    KeyWithPassphrase,
}

/// Secret material for a single connect attempt. Never persisted.
#[derive(Clone, Default)]
pub struct Credentials {
    pub password: Option<String>,
    /// OpenSSH/PEM encoded private key.
    pub private_key: Option<Vec<u8>>,
    /// OpenSSH encoded public key matching `private_key`.
    pub public_key: Option<Vec<u8>>,
    pub passphrase: Option<String>,
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Default::default()
        }
    }

    pub fn key(private_key: impl Into<Vec<u8>>) -> Self {
        Self {
            private_key: Some(private_key.into()),
            ..Default::default()
        }
    }

    pub fn with_public_key(mut self, public_key: impl Into<Vec<u8>>) -> Self {
        self.public_key = Some(public_key.into());
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Check that the populated fields match the auth method's shape.
    pub fn validate(&self, method: AuthMethod) -> TetherResult<()> {
        let ok = match method {
            AuthMethod::Password => self.password.is_some() && self.private_key.is_none(),
            AuthMethod::Key => {
                self.private_key.is_some() && self.password.is_none() && self.passphrase.is_none()
            }
            AuthMethod::KeyWithPassphrase => {
                self.private_key.is_some() && self.password.is_none() && self.passphrase.is_some()
            }
        };
        if ok {
            Ok(())
        } else {
            Err(TetherError::Config(format!(
                "credentials do not match auth method {method:?}"
            )))
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn mask<T>(v: &Option<T>) -> &'static str {
            if v.is_some() { "<redacted>" } else { "<none>" }
        }
        f.debug_struct("Credentials")
            .field("password", &mask(&self.password))
            .field("private_key", &mask(&self.private_key))
            .field("public_key", &mask(&self.public_key))
            .field("passphrase", &mask(&self.passphrase))
            .finish()
    }
}

/// Timeouts used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// TCP connect plus SSH handshake.
    pub connect: Duration,
    /// Interval between keep-alive requests (zero disables).
    pub keepalive: Duration,
    /// Default bound for `execute`.
    pub exec: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            keepalive: Duration::from_secs(30),
            exec: Duration::from_secs(30),
        }
    }
}

/// Mosh bootstrap settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoshOptions {
    /// Bound for the `mosh-server` availability probe.
    pub probe_timeout: Duration,
    /// Bound for `mosh-server new`.
    pub bootstrap_timeout: Duration,
    /// Bound for package-manager installation.
    pub install_timeout: Duration,
    /// Extra budget the client grants on top of `bootstrap_timeout`.
    pub bootstrap_grace: Duration,
    /// UDP port range offered to `mosh-server`.
    pub port_range: (u16, u16),
    /// Try to install `mosh-server` when it is missing.
    pub install_server: bool,
}

impl Default for MoshOptions {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(8),
            bootstrap_timeout: Duration::from_secs(25),
            install_timeout: Duration::from_secs(180),
            bootstrap_grace: Duration::from_secs(8),
            port_range: (60001, 60999),
            install_server: false,
        }
    }
}

/// Immutable parameters for one connection.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Advertised host, used for trust lookups.
    pub host: String,
    /// Advertised port.
    pub port: u16,
    /// Socket target when it differs from the advertised host (tunnels).
    pub dial_host: Option<String>,
    pub dial_port: Option<u16>,
    pub username: String,
    pub auth: AuthMethod,
    pub credentials: Credentials,
    pub transport: TransportMode,
    pub timeouts: Timeouts,
    pub mosh: MoshOptions,
}

impl SessionConfig {
    /// Password-authenticated config for `username@host:port`.
    pub fn with_password(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(host, port, username, AuthMethod::Password, Credentials::password(password))
    }

    /// Key-authenticated config; the method follows from the credentials.
    pub fn with_key(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        let auth = if credentials.passphrase.is_some() {
            AuthMethod::KeyWithPassphrase
        } else {
            AuthMethod::Key
        };
        Self::new(host, port, username, auth, credentials)
    }

    fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth: AuthMethod,
        credentials: Credentials,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            dial_host: None,
            dial_port: None,
            username: username.into(),
            auth,
            credentials,
            transport: TransportMode::default(),
            timeouts: Timeouts::default(),
            mosh: MoshOptions::default(),
        }
    }

    /// Dial a different socket target while keeping the advertised identity.
    pub fn via(mut self, dial_host: impl Into<String>, dial_port: u16) -> Self {
        self.dial_host = Some(dial_host.into());
        self.dial_port = Some(dial_port);
        self
    }

    pub fn transport(mut self, mode: TransportMode) -> Self {
        self.transport = mode;
        self
    }

    /// Host the socket actually connects to.
    pub fn dial_host(&self) -> &str {
        self.dial_host.as_deref().unwrap_or(&self.host)
    }

    /// Port the socket actually connects to.
    pub fn dial_port(&self) -> u16 {
        self.dial_port.unwrap_or(self.port)
    }

    /// Whether the dial target differs from the advertised endpoint.
    pub fn is_tunneled(&self) -> bool {
        self.dial_host() != self.host || self.dial_port() != self.port
    }

    /// `host:port` of the advertised endpoint.
    pub fn advertised(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::from(self)
    }
}

/// Identity of a connection for reuse decisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub transport: TransportMode,
    pub auth: AuthMethod,
    pub tunneled: bool,
}

impl From<&SessionConfig> for ConnectionKey {
    fn from(config: &SessionConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            transport: config.transport,
            auth: config.auth,
            tunneled: config.is_tunneled(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_defaults_to_advertised() {
        let cfg = SessionConfig::with_password("example.com", 22, "alice", "pw");
        assert_eq!(cfg.dial_host(), "example.com");
        assert_eq!(cfg.dial_port(), 22);
        assert!(!cfg.is_tunneled());
    }

    #[test]
    fn tunnel_keeps_advertised_identity() {
        let cfg =
            SessionConfig::with_password("example.com", 22, "alice", "pw").via("127.0.0.1", 2222);
        assert_eq!(cfg.advertised(), "example.com:22");
        assert_eq!(cfg.dial_host(), "127.0.0.1");
        assert!(cfg.is_tunneled());
        assert!(cfg.key().tunneled);
    }

    #[test]
    fn identical_configs_share_key() {
        let a = SessionConfig::with_password("h", 22, "u", "one");
        let b = SessionConfig::with_password("h", 22, "u", "two");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn any_field_change_changes_key() {
        let base = SessionConfig::with_password("h", 22, "u", "pw");
        assert_ne!(base.key(), SessionConfig::with_password("h2", 22, "u", "pw").key());
        assert_ne!(base.key(), SessionConfig::with_password("h", 2222, "u", "pw").key());
        assert_ne!(base.key(), SessionConfig::with_password("h", 22, "v", "pw").key());
        assert_ne!(base.key(), base.clone().transport(TransportMode::Mosh).key());
        assert_ne!(
            base.key(),
            SessionConfig::with_key("h", 22, "u", Credentials::key(b"k".to_vec())).key()
        );
    }

    #[test]
    fn key_method_follows_passphrase() {
        let plain = SessionConfig::with_key("h", 22, "u", Credentials::key(b"k".to_vec()));
        assert_eq!(plain.auth, AuthMethod::Key);
        let locked = SessionConfig::with_key(
            "h",
            22,
            "u",
            Credentials::key(b"k".to_vec()).with_passphrase("secret"),
        );
        assert_eq!(locked.auth, AuthMethod::KeyWithPassphrase);
    }

    #[test]
    fn credential_shape_validation() {
        assert!(Credentials::password("pw").validate(AuthMethod::Password).is_ok());
        assert!(Credentials::password("pw").validate(AuthMethod::Key).is_err());
        assert!(Credentials::key(b"k".to_vec()).validate(AuthMethod::Key).is_ok());
        assert!(Credentials::key(b"k".to_vec())
            .validate(AuthMethod::KeyWithPassphrase)
            .is_err());
    }

    #[test]
    fn debug_redacts_secrets() {
        let dbg = format!("{:?}", Credentials::password("hunter2"));
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<redacted>"));
    }
}
