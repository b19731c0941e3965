//! Error types and handling for the tunnel client

use std::io;
use thiserror::Error;

/// Main error type for tunnel operations
#[derive(Error, Debug)]
pub enum VpnError {
    /// Configuration errors (bad port, unreadable trust anchor, invalid knobs)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A token of the gateway parameter string could not be parsed
    #[error("Invalid parameter: {token}")]
    InvalidParameter { token: String },

    /// Socket creation, resolution, bind or protection failures
    #[error("Transport error: {0}")]
    Transport(String),

    /// The secure channel rejected the handshake
    #[error("Handshake failed (code {code}): {description}")]
    HandshakeFailed { code: i32, description: String },

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// TUN interface provisioning errors
    #[error("TUN/TAP error: {0}")]
    TunTap(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// TLS errors
    #[error("TLS error: {0}")]
    Tls(String),

    /// The operation was cancelled by the user or the supervisor
    #[error("Cancelled")]
    Cancelled,

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl VpnError {
    /// True when the error is a cooperative cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, VpnError::Cancelled)
    }
}

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, VpnError>;

/// Errors surfaced by a [`SecureChannel`](crate::channel::SecureChannel)
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Nothing to read right now; the caller paces its own polling
    #[error("no frame available")]
    WouldBlock,

    /// Protocol-level rejection during connect
    #[error("handshake rejected (code {code}): {description}")]
    HandshakeFailed { code: i32, description: String },

    /// No answer from the peer within the retry budget
    #[error("peer did not respond")]
    Timeout,

    /// Transport-level failure reaching the peer
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// The channel was shut down
    #[error("channel closed")]
    Closed,

    /// IO errors from the underlying socket
    #[error("channel IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<ChannelError> for VpnError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::HandshakeFailed { code, description } => {
                VpnError::HandshakeFailed { code, description }
            }
            ChannelError::Timeout => VpnError::Timeout("secure channel handshake".to_string()),
            ChannelError::Unreachable(msg) => VpnError::Transport(msg),
            ChannelError::Io(e) => VpnError::Io(e),
            ChannelError::WouldBlock => {
                VpnError::Io(io::Error::new(io::ErrorKind::WouldBlock, "no frame available"))
            }
            ChannelError::Closed => VpnError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "secure channel closed",
            )),
        }
    }
}

/// Helper trait for converting errors to VpnError
pub trait IntoVpnError<T> {
    fn into_vpn_error(self, context: &str) -> Result<T>;
}

impl<T, E> IntoVpnError<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn into_vpn_error(self, context: &str) -> Result<T> {
        self.map_err(|e| VpnError::Transport(format!("{context}: {e}")))
    }
}

// Implement From for common error types
impl From<toml::de::Error> for VpnError {
    fn from(err: toml::de::Error) -> Self {
        VpnError::Config(format!("TOML parsing error: {err}"))
    }
}

impl From<rustls::Error> for VpnError {
    fn from(err: rustls::Error) -> Self {
        VpnError::Tls(err.to_string())
    }
}
