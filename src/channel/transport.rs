//! UDP transport socket setup: resolution, routing-loop protection, connect
//! knock

use crate::cancel::CancelToken;
use crate::config::TunnelSettings;
use crate::error::{IntoVpnError, Result, VpnError};
use crate::protocol::ControlMessage;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};

/// Exempts the transport socket from being routed through the tunnel itself
pub trait SocketProtector: Send + Sync {
    fn protect(&self, socket: &UdpSocket) -> io::Result<()>;
}

/// Leaves the socket untouched (hosts that route the gateway explicitly)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProtection;

impl SocketProtector for NoProtection {
    fn protect(&self, _socket: &UdpSocket) -> io::Result<()> {
        Ok(())
    }
}

/// Marks the socket with `SO_MARK` so policy routing can bypass the tunnel
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
pub struct FwMarkProtector {
    mark: u32,
}

#[cfg(target_os = "linux")]
impl FwMarkProtector {
    pub fn new(mark: u32) -> Self {
        Self { mark }
    }
}

#[cfg(target_os = "linux")]
impl SocketProtector for FwMarkProtector {
    fn protect(&self, socket: &UdpSocket) -> io::Result<()> {
        let mark: libc::c_uint = self.mark;
        // SAFETY: the fd is owned by `socket` for the duration of the call and
        // the option value points to a live c_uint of the advertised size.
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_MARK,
                &mark as *const libc::c_uint as *const libc::c_void,
                std::mem::size_of::<libc::c_uint>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Host-supplied protection callback, e.g. a mobile VPN service's `protect(fd)`
#[cfg(unix)]
pub struct FnProtector<F>(pub F);

#[cfg(unix)]
impl<F> SocketProtector for FnProtector<F>
where
    F: Fn(RawFd) -> bool + Send + Sync,
{
    fn protect(&self, socket: &UdpSocket) -> io::Result<()> {
        if (self.0)(socket.as_raw_fd()) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "host refused to protect the socket",
            ))
        }
    }
}

/// Resolve the gateway to a single socket address
pub async fn resolve_gateway(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| VpnError::Transport(format!("Cannot resolve {host}:{port}: {e}")))?;
    addrs
        .next()
        .ok_or_else(|| VpnError::Transport(format!("No address found for {host}:{port}")))
}

/// Create the transport socket, protect it, then connect it to `peer`
///
/// Protection happens before any traffic leaves the socket.
pub fn open_transport(peer: SocketAddr, protector: &dyn SocketProtector) -> Result<UdpSocket> {
    let local: SocketAddr = if peer.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(local).into_vpn_error("Cannot create tunnel socket")?;
    protector
        .protect(&socket)
        .into_vpn_error("Cannot protect the tunnel socket")?;
    socket
        .connect(peer)
        .into_vpn_error(&format!("Cannot connect tunnel socket to {peer}"))?;

    Ok(socket)
}

/// Announce the client to the gateway listener before the secure handshake
pub async fn knock(
    socket: &UdpSocket,
    settings: &TunnelSettings,
    cancel: &CancelToken,
) -> Result<()> {
    let frame = ControlMessage::WantConnect.frame();
    for i in 0..settings.knock_repeats {
        socket
            .send(&frame)
            .map_err(|e| VpnError::Transport(format!("Lost connection with gateway: {e}")))?;
        if i + 1 < settings.knock_repeats && !cancel.sleep(settings.knock_spacing).await {
            return Err(VpnError::Cancelled);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Refuse;

    impl SocketProtector for Refuse {
        fn protect(&self, _socket: &UdpSocket) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "no"))
        }
    }

    #[tokio::test]
    async fn test_open_and_knock() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        listener
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let peer = listener.local_addr().unwrap();

        let socket = open_transport(peer, &NoProtection).unwrap();
        let settings = TunnelSettings {
            knock_repeats: 2,
            knock_spacing: Duration::from_millis(1),
            ..TunnelSettings::default()
        };
        knock(&socket, &settings, &CancelToken::new()).await.unwrap();

        let mut buf = [0u8; 16];
        for _ in 0..2 {
            let n = listener.recv(&mut buf).unwrap();
            assert_eq!(&buf[..n], &[0x00, 0x01]);
        }
    }

    #[test]
    fn test_protection_failure_is_transport_error() {
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let err = open_transport(peer, &Refuse).unwrap_err();
        assert!(matches!(err, VpnError::Transport(_)));
        assert!(err.to_string().contains("protect"));
    }

    #[cfg(unix)]
    #[test]
    fn test_fn_protector_sees_socket_fd() {
        use std::sync::atomic::{AtomicI32, Ordering};
        use std::sync::Arc;

        let seen = Arc::new(AtomicI32::new(-1));
        let record = seen.clone();
        let protector = FnProtector(move |fd: RawFd| {
            record.store(fd, Ordering::SeqCst);
            true
        });

        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let socket = open_transport(peer, &protector).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), socket.as_raw_fd());
    }

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let addr = resolve_gateway("127.0.0.1", 4433).await.unwrap();
        assert_eq!(addr, "127.0.0.1:4433".parse::<SocketAddr>().unwrap());
    }
}
