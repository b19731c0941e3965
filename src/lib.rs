//! tunlink - Point-to-point packet tunnel client core
//!
//! This library keeps an encrypted tunnel to a single gateway alive and
//! moves IP packets between a local virtual interface and the gateway.
//!
//! ## What This Library Provides
//! - Connection supervision with a bounded, immediate reconnect policy
//! - Per-attempt tunnel sessions: transport socket setup and protection,
//!   secure-channel handshake, parameter negotiation, packet forwarding
//! - The gateway parameter grammar (`m`, `a`, `r`, `d`, `s` fields)
//! - Lifecycle signals for a UI (`Connecting`, `Connected`, ...)
//! - Configuration parsing and validation (TOML format)
//! - A Linux TUN provisioner and in-memory test doubles
//!
//! ## What Your Application Must Provide
//! - The secure datagram channel itself (DTLS or equivalent), through
//!   [`channel::ChannelFactory`]
//! - Interface provisioning on platforms without the bundled TUN provisioner,
//!   through [`tunnel::InterfaceProvisioner`]
//! - Socket protection when the gateway route is not excluded otherwise
//!
//! ## Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use tunlink::channel::ScriptedFactory;
//! use tunlink::tunnel::MemoryProvisioner;
//! use tunlink::{Config, ConnectionSupervisor, Platform};
//!
//! # async fn demo() -> tunlink::Result<()> {
//! let config: Config = "[gateway]\naddress = \"vpn.example.net\"\nport = 4433".parse()?;
//! let (factory, _gateways) = ScriptedFactory::new();
//! let platform = Platform::from_config(
//!     &config,
//!     Arc::new(factory),
//!     Arc::new(MemoryProvisioner::new()),
//! )?;
//!
//! let supervisor = ConnectionSupervisor::spawn(config, platform)?;
//! let (signals, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! supervisor.bind(signals)?;
//! supervisor.connect()?;
//! while let Some(signal) = rx.recv().await {
//!     println!("{signal}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod supervisor;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

// Re-export core types
pub use config::Config;
pub use error::{Result, VpnError};
pub use platform::Platform;
pub use protocol::TunnelConfig;
pub use supervisor::{
    ConnectionState, ConnectionSupervisor, Reason, Signal, SignalKind, SupervisorHandle,
};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
