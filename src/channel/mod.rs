//! Secure datagram channel abstraction
//!
//! The encrypted transport (DTLS or equivalent) is supplied by the host
//! through a [`ChannelFactory`]. The core only relies on the hand-off points
//! below: connect against a fixed peer, non-blocking framed read/write,
//! peer identity for diagnostics, and teardown.

use crate::crypto::TrustAnchor;
use crate::error::ChannelError;
use bytes::Bytes;
use std::fmt;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

pub mod loopback;
pub mod transport;

pub use loopback::{ConnectOutcome, LoopbackChannel, ScriptedFactory};
pub use transport::{NoProtection, SocketProtector};

/// Identity of the connected gateway, used only for logging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub issuer: Option<String>,
    pub subject: Option<String>,
    pub alt_names: Vec<String>,
    pub protocol_version: String,
    pub cipher: String,
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subject={} issuer={} version={} cipher={}",
            self.subject.as_deref().unwrap_or("-"),
            self.issuer.as_deref().unwrap_or("-"),
            self.protocol_version,
            self.cipher
        )
    }
}

/// Encrypted, connectionless transport to a single gateway
///
/// All methods take `&self`: the forwarding loop writes while a concurrent
/// reader task reads, exactly like a connected UDP socket.
pub trait SecureChannel: Send + Sync {
    /// Run the handshake against `peer`. May block up to the
    /// implementation's own retransmission budget.
    fn connect(&self, peer: SocketAddr) -> Result<(), ChannelError>;

    /// Return one decrypted frame of at most `max_len` bytes, or
    /// [`ChannelError::WouldBlock`] when nothing is pending.
    fn read(&self, max_len: usize) -> Result<Bytes, ChannelError>;

    /// Encrypt and send one frame, returning the bytes accepted
    fn write(&self, frame: &[u8]) -> Result<usize, ChannelError>;

    /// Gateway certificate and session details
    fn peer_identity(&self) -> PeerInfo;

    /// Tear the channel down; later reads and writes fail with `Closed`
    fn shutdown(&self);
}

/// Builds a [`SecureChannel`] on top of an already protected and connected
/// transport socket. Trust decisions happen inside `connect`, against the
/// supplied anchor.
pub trait ChannelFactory: Send + Sync {
    fn create(
        &self,
        socket: UdpSocket,
        trust: &TrustAnchor,
    ) -> Result<Arc<dyn SecureChannel>, ChannelError>;
}

/// Log the peer certificate details the way a diagnostics dump would
pub(crate) fn log_peer(tag: &str, peer: &PeerInfo) {
    log::info!(
        "{tag} issuer: {}",
        peer.issuer.as_deref().unwrap_or("<none>")
    );
    log::info!(
        "{tag} subject: {}",
        peer.subject.as_deref().unwrap_or("<none>")
    );
    for alt in &peer.alt_names {
        log::info!("{tag} altname = {alt}");
    }
    log::info!("{tag} protocol version is {}", peer.protocol_version);
    log::info!("{tag} cipher suite is {}", peer.cipher);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_info_display() {
        let peer = PeerInfo {
            issuer: Some("CN=root".into()),
            subject: Some("CN=gw".into()),
            alt_names: vec!["gw.example.net".into()],
            protocol_version: "DTLSv1.2".into(),
            cipher: "ECDHE-ECDSA-AES128-GCM-SHA256".into(),
        };
        let text = peer.to_string();
        assert!(text.contains("subject=CN=gw"));
        assert!(text.contains("DTLSv1.2"));

        assert!(PeerInfo::default().to_string().contains("issuer=-"));
    }
}
