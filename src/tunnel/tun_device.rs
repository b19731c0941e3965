//! Linux TUN provisioner
//!
//! Creates the device with the `tun` crate, then adds the remaining
//! addresses and routes with `ip`. DNS servers and search domains are only
//! logged; resolver configuration belongs to the host.
//!
//! The previous device stays open until its replacement is established, so
//! every device gets a name this provisioner is not already holding. A `%d`
//! in the configured name is replaced by the lowest free index; a plain name
//! gets an index appended when it is taken.

use super::{InterfaceProvisioner, VirtualInterface};
use crate::error::{Result, VpnError};
use crate::protocol::TunnelConfig;
use ipnet::{IpNet, Ipv4Net};
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::collections::HashSet;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const DEFAULT_INTERFACE_NAME: &str = "tunlink%d";

/// Longest interface name Linux accepts (`IFNAMSIZ - 1`)
const MAX_NAME_LEN: usize = 15;

type HeldNames = Arc<Mutex<HashSet<String>>>;

/// First name from `template` that is not in `held`
fn free_name(template: &str, held: &HashSet<String>) -> Result<String> {
    let candidate = |index: usize| {
        if template.contains("%d") {
            template.replacen("%d", &index.to_string(), 1)
        } else if index == 0 {
            template.to_string()
        } else {
            format!("{template}{index}")
        }
    };

    (0..=held.len())
        .map(candidate)
        .find(|name| !held.contains(name))
        .filter(|name| name.len() <= MAX_NAME_LEN)
        .ok_or_else(|| VpnError::TunTap(format!("No usable interface name for {template}")))
}

/// Builds TUN devices from negotiated parameters
#[derive(Debug, Clone)]
pub struct TunProvisioner {
    interface_name: String,
    held: HeldNames,
}

impl TunProvisioner {
    /// `interface_name` may contain `%d`; defaults to `tunlink%d`
    pub fn new(interface_name: Option<String>) -> Self {
        Self {
            interface_name: interface_name.unwrap_or_else(|| DEFAULT_INTERFACE_NAME.to_string()),
            held: HeldNames::default(),
        }
    }

    /// Reserve a name no open device of ours is using
    fn reserve_name(&self) -> Result<String> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let name = free_name(&self.interface_name, &held)?;
        held.insert(name.clone());
        Ok(name)
    }

    fn release_name(&self, name: &str) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    fn ip(args: &[&str]) -> Result<()> {
        let output = Command::new("ip")
            .args(args)
            .output()
            .map_err(|e| VpnError::TunTap(format!("Failed to run ip {}: {e}", args.join(" "))))?;

        if !output.status.success() {
            let error_msg = String::from_utf8_lossy(&output.stderr);
            return Err(VpnError::TunTap(format!(
                "ip {} failed: {}",
                args.join(" "),
                error_msg.trim()
            )));
        }
        Ok(())
    }
}

impl Default for TunProvisioner {
    fn default() -> Self {
        Self::new(None)
    }
}

impl InterfaceProvisioner for TunProvisioner {
    fn establish(
        &self,
        config: &TunnelConfig,
        session_name: &str,
    ) -> Result<Arc<dyn VirtualInterface>> {
        let primary = config
            .addresses
            .iter()
            .find_map(|net| match net {
                IpNet::V4(v4) => Some(*v4),
                IpNet::V6(_) => None,
            })
            .ok_or_else(|| VpnError::TunTap("Gateway pushed no IPv4 address".to_string()))?;

        let name = self.reserve_name()?;
        match self.create(&name, primary, config, session_name) {
            Ok(interface) => Ok(interface),
            Err(e) => {
                self.release_name(&name);
                Err(e)
            }
        }
    }
}

impl TunProvisioner {
    fn create(
        &self,
        name: &str,
        primary: Ipv4Net,
        config: &TunnelConfig,
        session_name: &str,
    ) -> Result<Arc<dyn VirtualInterface>> {
        let mut tun_config = tun::Configuration::default();
        tun_config
            .name(name)
            .address(primary.addr())
            .netmask(primary.netmask())
            .mtu(i32::from(config.mtu))
            .up();
        tun_config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create(&tun_config)
            .map_err(|e| VpnError::TunTap(format!("TUN interface creation failed: {e}")))?;
        let interface = TunInterface::new(name.to_string(), device, self.held.clone())?;

        for net in config.addresses.iter().filter(|net| **net != IpNet::V4(primary)) {
            Self::ip(&["addr", "add", &net.to_string(), "dev", name])?;
        }
        for route in &config.routes {
            Self::ip(&["route", "replace", &route.to_string(), "dev", name])?;
        }
        for dns in &config.dns_servers {
            log::info!("DNS server for {name}: {dns}");
        }
        for domain in &config.search_domains {
            log::info!("Search domain for {name}: {domain}");
        }

        log::info!("New interface: {name} ({config}) for {session_name}");
        Ok(Arc::new(interface))
    }
}

/// A TUN device in non-blocking mode
pub struct TunInterface {
    name: String,
    fd: RawFd,
    device: Mutex<Option<tun::platform::Device>>,
    closed: AtomicBool,
    held: HeldNames,
}

impl TunInterface {
    fn new(name: String, device: tun::platform::Device, held: HeldNames) -> Result<Self> {
        let fd = device.as_raw_fd();
        // SAFETY: `fd` belongs to `device`, which outlives this call.
        let rc = unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 {
                flags
            } else {
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)
            }
        };
        if rc < 0 {
            return Err(VpnError::TunTap(format!(
                "Failed to make {name} non-blocking: {}",
                io::Error::last_os_error()
            )));
        }

        Ok(Self {
            name,
            fd,
            device: Mutex::new(Some(device)),
            closed: AtomicBool::new(false),
            held,
        })
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("interface {} is closed", self.name),
            ))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for TunInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunInterface")
            .field("name", &self.name)
            .field("fd", &self.fd)
            .field("closed", &self.closed)
            .finish()
    }
}

impl VirtualInterface for TunInterface {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        // SAFETY: the device is only dropped after `closed` is set, and `buf`
        // is a valid writable region of the given length.
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn write(&self, packet: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        // SAFETY: as for `read`; the packet slice is valid for its length.
        let n = unsafe {
            libc::write(
                self.fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let device = self.device.lock().unwrap_or_else(|e| e.into_inner()).take();
            drop(device);
            self.held
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.name);
            log::info!("Closed interface {}", self.name);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TunInterface {
    fn drop(&mut self) {
        self.close();
    }
}
