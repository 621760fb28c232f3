//! tether-core: Shared vocabulary for the tether remote-shell engine.
//!
//! Provides the error taxonomy, session configuration and connection keys,
//! the channel and session traits the engine is written against, host
//! fingerprints, mosh connect-banner parsing and POSIX shell quoting.
//! Nothing in this crate performs I/O.

pub mod config;
pub mod error;
pub mod identity;
pub mod mosh;
pub mod quote;
pub mod transport;

// Re-export commonly used items at crate root.
pub use config::{AuthMethod, ConnectionKey, Credentials, MoshOptions, SessionConfig, Timeouts};
pub use error::{TetherError, TetherResult};
pub use identity::{fingerprint, short_fingerprint};
pub use mosh::{parse_connect_output, MoshBootstrapError, MoshConnectInfo};
pub use quote::shell_quote;
pub use transport::{
    ChannelId, ChannelIo, FallbackReason, IoFuture, ReadOutcome, ReadyFuture, SessionBackend,
    ShellTransport, TransportMode,
};
