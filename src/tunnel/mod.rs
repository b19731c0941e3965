//! Virtual interface boundary and the data-plane loop
//!
//! The core never creates OS devices itself. It asks an
//! [`InterfaceProvisioner`] for a handle built from the negotiated
//! [`TunnelConfig`] and moves packets through the returned
//! [`VirtualInterface`].

use crate::error::Result;
use crate::protocol::TunnelConfig;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

pub mod forwarder;
pub mod memory;
#[cfg(target_os = "linux")]
pub mod tun_device;

pub use forwarder::{ForwarderStats, PacketForwarder, StatsSnapshot};
pub use memory::{MemoryInterface, MemoryProvisioner};
#[cfg(target_os = "linux")]
pub use tun_device::{TunInterface, TunProvisioner};

/// Packet-level handle on a provisioned interface
///
/// Reads never block: an empty interface reports
/// [`io::ErrorKind::WouldBlock`].
pub trait VirtualInterface: Send + Sync + fmt::Debug {
    /// Read one packet into `buf`
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet
    fn write(&self, packet: &[u8]) -> io::Result<usize>;

    /// Release the device; later reads and writes fail
    fn close(&self);

    fn name(&self) -> &str;
}

/// Host collaborator that turns negotiated parameters into an interface
pub trait InterfaceProvisioner: Send + Sync {
    fn establish(
        &self,
        config: &TunnelConfig,
        session_name: &str,
    ) -> Result<Arc<dyn VirtualInterface>>;
}

/// The supervisor's reference to the interface in use
///
/// Installing a replacement closes the previous interface only after the new
/// one is in place, so traffic always has somewhere to go. Reinstalling the
/// interface already held is a no-op.
#[derive(Debug, Default)]
pub struct InterfaceSlot {
    current: Mutex<Option<Arc<dyn VirtualInterface>>>,
}

impl InterfaceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, interface: Arc<dyn VirtualInterface>) {
        let previous = {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if current.as_ref().is_some_and(|held| Arc::ptr_eq(held, &interface)) {
                log::debug!("Interface {} already installed", interface.name());
                return;
            }
            current.replace(interface)
        };
        if let Some(old) = previous {
            log::debug!("Closing replaced interface {}", old.name());
            old.close();
        }
    }

    /// Close and forget the current interface
    pub fn release(&self) {
        let previous = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(old) = previous {
            log::debug!("Releasing interface {}", old.name());
            old.close();
        }
    }

    pub fn current(&self) -> Option<Arc<dyn VirtualInterface>> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_held(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}
