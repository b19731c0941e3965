//! In-memory virtual interface, for hosts that shuttle packets themselves
//! and for tests

use super::{InterfaceProvisioner, VirtualInterface};
use crate::error::{Result, VpnError};
use crate::protocol::TunnelConfig;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct MemoryInterface {
    name: String,
    outgoing: Mutex<VecDeque<Bytes>>,
    delivered: Mutex<VecDeque<Bytes>>,
    closed: AtomicBool,
}

impl MemoryInterface {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            outgoing: Mutex::new(VecDeque::new()),
            delivered: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a packet as if an application had sent it into the tunnel
    pub fn inject(&self, packet: &[u8]) {
        self.outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Bytes::copy_from_slice(packet));
    }

    /// Packets the tunnel has written to this interface, oldest first
    pub fn take_delivered(&self) -> Vec<Bytes> {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    /// Wait up to `wait` for the next delivered packet
    pub async fn recv_delivered(&self, wait: Duration) -> Option<Bytes> {
        let deadline = Instant::now() + wait;
        loop {
            let next = self
                .delivered
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            if next.is_some() || Instant::now() >= deadline {
                return next;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> io::Result<()> {
        if self.is_closed() {
            Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("interface {} is closed", self.name),
            ))
        } else {
            Ok(())
        }
    }
}

impl VirtualInterface for MemoryInterface {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        let packet = self
            .outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match packet {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn write(&self, packet: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Bytes::copy_from_slice(packet));
        Ok(packet.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Provisioner handing out [`MemoryInterface`]s and recording what it was
/// asked for
#[derive(Debug, Default)]
pub struct MemoryProvisioner {
    interfaces: Mutex<Vec<Arc<MemoryInterface>>>,
    configs: Mutex<Vec<(TunnelConfig, String)>>,
    failing: AtomicBool,
}

impl MemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every interface established so far
    pub fn interfaces(&self) -> Vec<Arc<MemoryInterface>> {
        self.interfaces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last_interface(&self) -> Option<Arc<MemoryInterface>> {
        self.interfaces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }

    /// Configurations and session names passed to `establish`
    pub fn configs(&self) -> Vec<(TunnelConfig, String)> {
        self.configs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Make `establish` fail, as a host refusing the interface would
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl InterfaceProvisioner for MemoryProvisioner {
    fn establish(
        &self,
        config: &TunnelConfig,
        session_name: &str,
    ) -> Result<Arc<dyn VirtualInterface>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(VpnError::TunTap("interface establishment refused".to_string()));
        }

        let mut interfaces = self.interfaces.lock().unwrap_or_else(|e| e.into_inner());
        let interface = Arc::new(MemoryInterface::new(&format!("mem{}", interfaces.len())));
        interfaces.push(interface.clone());
        self.configs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((config.clone(), session_name.to_string()));

        log::info!(
            "New interface: {} ({config}) for {session_name}",
            interface.name()
        );
        Ok(interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_queues() {
        let iface = MemoryInterface::new("mem0");
        let mut buf = [0u8; 64];
        assert_eq!(
            iface.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        iface.inject(&[0x45, 1, 2]);
        assert_eq!(iface.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[0x45, 1, 2]);

        iface.write(&[0x60, 9]).unwrap();
        assert_eq!(iface.take_delivered(), vec![Bytes::from_static(&[0x60, 9])]);

        iface.close();
        assert!(iface.write(&[0x45]).is_err());
        assert!(iface.read(&mut buf).is_err());
    }

    #[test]
    fn test_provisioner_records_requests() {
        let provisioner = MemoryProvisioner::new();
        let config = TunnelConfig::parse("m,1400 a,10.0.0.2,32").unwrap();
        let iface = provisioner.establish(&config, "office").unwrap();
        assert_eq!(iface.name(), "mem0");
        assert_eq!(provisioner.configs(), vec![(config.clone(), "office".to_string())]);

        provisioner.set_failing(true);
        assert!(matches!(
            provisioner.establish(&config, "office"),
            Err(VpnError::TunTap(_))
        ));
        assert_eq!(provisioner.interfaces().len(), 1);
    }
}
