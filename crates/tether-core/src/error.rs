use thiserror::Error;

/// Errors produced by the tether engine.
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("not connected")]
    NotConnected,

    #[error("already connected to a different host or identity")]
    AlreadyConnected,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("host key verification failed for {host}: expected {expected}, got {actual}")]
    HostKeyVerificationFailed {
        host: String,
        expected: String,
        actual: String,
    },

    #[error("failed to open channel")]
    ChannelOpenFailed,

    #[error("shell request rejected by server")]
    ShellRequestFailed,

    #[error("unknown channel: {0}")]
    UnknownChannel(u32),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("timeout")]
    Timeout,

    #[error("mosh-server is not installed on the remote host")]
    MoshServerMissing,

    #[error("mosh bootstrap failed: {0}")]
    MoshBootstrapFailed(String),

    #[error("mosh session failed: {0}")]
    MoshSessionFailed(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Unknown(String),
}

pub type TetherResult<T> = Result<T, TetherError>;
