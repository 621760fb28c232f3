//! Parsing of the `mosh-server new` connect banner.
//!
//! On success `mosh-server` prints, among other chatter:
//!
//! ```text
//! MOSH CONNECT 60001 4NeCCgvZFe2RnPgrcU1PQw
//! ```
//!
//! The port is decimal and the key is a 22-character base64 token encoding
//! a 16-byte AES key. Anything else on that line is an error.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use thiserror::Error;

use crate::error::TetherError;

/// Length of the base64 session key in the banner.
pub const KEY_LEN: usize = 22;

const BANNER_PREFIX: &str = "MOSH CONNECT";

// mosh-server strips the "==" padding and does not zero the trailing bits.
const KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::RequireNone)
        .with_decode_allow_trailing_bits(true),
);

/// Endpoint parameters parsed from a connect banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoshConnectInfo {
    /// UDP port the server is listening on.
    pub port: u16,
    /// Base64 session key, exactly as printed by the server.
    pub key: String,
}

impl MoshConnectInfo {
    /// Decode the session key into raw AES key bytes.
    pub fn key_bytes(&self) -> Result<[u8; 16], MoshBootstrapError> {
        decode_key(&self.key)
    }
}

/// Ways a mosh bootstrap can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoshBootstrapError {
    #[error("mosh-server not found on remote host")]
    ServerMissing,

    #[error("invalid MOSH CONNECT line: {0}")]
    InvalidConnectLine(String),

    #[error("invalid mosh port: {0}")]
    InvalidPort(String),

    #[error("invalid mosh session key")]
    InvalidKey,

    #[error("mosh-server exited without a connect line: {0}")]
    ProcessExited(String),

    #[error("mosh bootstrap timed out")]
    TimedOut,
}

impl From<MoshBootstrapError> for TetherError {
    fn from(e: MoshBootstrapError) -> Self {
        match e {
            MoshBootstrapError::ServerMissing => TetherError::MoshServerMissing,
            other => TetherError::MoshBootstrapFailed(other.to_string()),
        }
    }
}

/// Extract the connect info from the combined output of `mosh-server new`.
///
/// Surrounding lines are ignored; exactly one banner line must be present.
pub fn parse_connect_output(output: &str) -> Result<MoshConnectInfo, MoshBootstrapError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(MoshBootstrapError::InvalidConnectLine("empty output".into()));
    }

    let banners: Vec<&str> = trimmed
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(BANNER_PREFIX))
        .collect();

    match banners.as_slice() {
        [] if is_missing_binary(trimmed) => Err(MoshBootstrapError::ServerMissing),
        [] => Err(MoshBootstrapError::ProcessExited(first_line(trimmed))),
        [line] => parse_connect_line(line),
        _ => Err(MoshBootstrapError::InvalidConnectLine(format!(
            "{} connect lines in output",
            banners.len()
        ))),
    }
}

/// Parse a single `MOSH CONNECT <port> <key>` line.
pub fn parse_connect_line(line: &str) -> Result<MoshConnectInfo, MoshBootstrapError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let [magic, verb, port, key] = fields.as_slice() else {
        return Err(MoshBootstrapError::InvalidConnectLine(line.to_string()));
    };
    if *magic != "MOSH" || *verb != "CONNECT" {
        return Err(MoshBootstrapError::InvalidConnectLine(line.to_string()));
    }

    let port = match port.parse::<u16>() {
        Ok(p) if p != 0 => p,
        _ => return Err(MoshBootstrapError::InvalidPort((*port).to_string())),
    };

    decode_key(key)?;

    Ok(MoshConnectInfo {
        port,
        key: (*key).to_string(),
    })
}

fn decode_key(key: &str) -> Result<[u8; 16], MoshBootstrapError> {
    if key.len() != KEY_LEN {
        return Err(MoshBootstrapError::InvalidKey);
    }
    let bytes = KEY_ENGINE
        .decode(key)
        .map_err(|_| MoshBootstrapError::InvalidKey)?;
    bytes.try_into().map_err(|_| MoshBootstrapError::InvalidKey)
}

fn is_missing_binary(output: &str) -> bool {
    output.lines().any(|line| {
        line.contains("mosh-server")
            && (line.contains("not found") || line.contains("No such file"))
    })
}

fn first_line(output: &str) -> String {
    output.lines().next().unwrap_or_default().to_string()
}
