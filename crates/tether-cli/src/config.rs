//! Client configuration at `~/.tether/config.toml`.
//!
//! Provides default port, user, transport and identity settings.
//! CLI flags always override config file values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tether_core::TransportMode;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Default connection settings.
    #[serde(default)]
    pub default: DefaultConfig,
}

/// Default connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultConfig {
    /// Default SSH port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Remote user when the target has no `user@` part.
    #[serde(default)]
    pub user: Option<String>,

    /// Shell transport: "ssh" or "mosh".
    #[serde(default)]
    pub transport: TransportMode,

    /// Private key path. `~` is expanded.
    #[serde(default)]
    pub identity: Option<String>,

    /// Keep-alive interval in seconds; 0 disables it.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Install mosh-server on hosts that lack it.
    #[serde(default)]
    pub install_mosh_server: bool,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            user: None,
            transport: TransportMode::default(),
            identity: None,
            keepalive_secs: default_keepalive_secs(),
            install_mosh_server: false,
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_keepalive_secs() -> u64 {
    30
}

impl Config {
    /// `~/.tether/config.toml`.
    pub fn default_path() -> PathBuf {
        tether_dir().join("config.toml")
    }

    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

/// `~/.tether`, or `.tether` when the home directory is unknown.
pub fn tether_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(".tether")
}

/// Expand a leading `~/` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().unwrap_or_default().join(rest),
        None => PathBuf::from(path),
    }
}

/// Parse a `[user@]host` string into `(user, host)`.
///
/// Without a user part, `fallback_user` is used, then the current system
/// username (or "root").
pub fn parse_target(target: &str, fallback_user: Option<&str>) -> Result<(String, String)> {
    if let Some((user, host)) = target.rsplit_once('@') {
        if user.is_empty() {
            anyhow::bail!("empty username in target '{target}'");
        }
        if host.is_empty() {
            anyhow::bail!("empty host in target '{target}'");
        }
        Ok((user.to_string(), host.to_string()))
    } else {
        if target.is_empty() {
            anyhow::bail!("empty host");
        }
        let user = match fallback_user {
            Some(user) => user.to_string(),
            None => std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "root".into()),
        };
        Ok((user, target.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_user_at_host() {
        let (user, host) = parse_target("alice@example.com", None).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(host, "example.com");
    }

    #[test]
    fn parse_host_only_uses_fallback_user() {
        let (user, host) = parse_target("example.com", Some("deploy")).unwrap();
        assert_eq!(user, "deploy");
        assert_eq!(host, "example.com");

        let (user, _) = parse_target("example.com", None).unwrap();
        assert!(!user.is_empty());
    }

    #[test]
    fn parse_user_containing_at() {
        let (user, host) = parse_target("alice@corp@bastion", None).unwrap();
        assert_eq!(user, "alice@corp");
        assert_eq!(host, "bastion");
    }

    #[test]
    fn parse_empty_parts_fail() {
        assert!(parse_target("@example.com", None).is_err());
        assert!(parse_target("alice@", None).is_err());
        assert!(parse_target("", None).is_err());
    }

    #[test]
    fn default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.default.port, 22);
        assert_eq!(cfg.default.transport, TransportMode::Ssh);
        assert_eq!(cfg.default.keepalive_secs, 30);
        assert!(cfg.default.identity.is_none());
        assert!(!cfg.default.install_mosh_server);
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[default]
port = 2222
user = "deploy"
transport = "mosh"
identity = "~/.ssh/id_ed25519"
keepalive_secs = 15
install_mosh_server = true
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.default.port, 2222);
        assert_eq!(cfg.default.user.as_deref(), Some("deploy"));
        assert_eq!(cfg.default.transport, TransportMode::Mosh);
        assert_eq!(cfg.default.identity.as_deref(), Some("~/.ssh/id_ed25519"));
        assert_eq!(cfg.default.keepalive_secs, 15);
        assert!(cfg.default.install_mosh_server);
    }

    #[test]
    fn parse_partial_toml_config() {
        let toml_str = r#"
[default]
user = "ops"
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.default.user.as_deref(), Some("ops"));
        assert_eq!(cfg.default.port, 22); // default
        assert_eq!(cfg.default.transport, TransportMode::Ssh); // default
    }

    #[test]
    fn unknown_transport_is_rejected() {
        let toml_str = "[default]\ntransport = \"telnet\"\n";
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.default.port, 22);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[default]\nport = 2200\n").unwrap();
        assert_eq!(Config::load(&path).unwrap().default.port, 2200);
    }

    #[test]
    fn tilde_expands_to_home() {
        let expanded = expand_tilde("~/.ssh/id_rsa");
        assert!(expanded.ends_with(".ssh/id_rsa"));
        assert_eq!(expand_tilde("/etc/key"), PathBuf::from("/etc/key"));
    }
}
