//! Cryptographic plumbing for the secure channel
//!
//! The secure datagram handshake itself is supplied by a
//! [`ChannelFactory`](crate::channel::ChannelFactory); this module only owns the
//! root of trust those implementations verify the gateway against.

pub mod tls;

/// Root certificates the gateway's identity is checked against
pub use tls::TrustAnchor;
