//! Shared fixtures for session and supervisor tests

use crate::channel::{LoopbackChannel, ScriptedFactory, SecureChannel};
use crate::config::{Config, TunnelSection, TunnelSettings};
use crate::platform::Platform;
use crate::protocol::{CONTROL_MARKER, REQUEST_FRAME_LEN};
use crate::tunnel::MemoryProvisioner;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) const PARAMS: &str = "m,1400 a,10.0.0.2,32 r,0.0.0.0,0 d,8.8.8.8";

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn fast_tunnel() -> TunnelSection {
    TunnelSection {
        idle_interval_ms: 1,
        keepalive_interval_ms: 60_000,
        keepalive_burst: 3,
        max_handshake_attempts: 200,
        request_repeats: 2,
        request_spacing_ms: 1,
        knock_repeats: 1,
        knock_spacing_ms: 1,
        connect_timeout_secs: 2,
        max_reconnect_attempts: 10,
        disconnect_notice_repeats: 2,
    }
}

pub(crate) fn fast_settings() -> TunnelSettings {
    TunnelSettings::from(&fast_tunnel())
}

/// Everything a session needs, backed by loopback channels and memory
/// interfaces. The listener keeps the gateway port open for knocks.
pub(crate) struct Harness {
    pub listener: UdpSocket,
    pub config: Config,
    pub factory: Arc<ScriptedFactory>,
    pub gateways: mpsc::UnboundedReceiver<LoopbackChannel>,
    pub provisioner: Arc<MemoryProvisioner>,
    pub platform: Platform,
}

pub(crate) fn harness() -> Harness {
    init_logging();
    let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut config = Config::for_gateway("127.0.0.1", port);
    config.tunnel = fast_tunnel();

    let (factory, gateways) = ScriptedFactory::new();
    let factory = Arc::new(factory);
    let provisioner = Arc::new(MemoryProvisioner::new());
    let platform = Platform::new(factory.clone(), provisioner.clone());

    Harness {
        listener,
        config,
        factory,
        gateways,
        provisioner,
        platform,
    }
}

/// Answer the first parameter request on `gateway` with `params`
pub(crate) fn serve_parameters(
    gateway: LoopbackChannel,
    params: &'static str,
) -> JoinHandle<LoopbackChannel> {
    tokio::spawn(async move {
        while let Ok(frame) = gateway.recv(Duration::from_secs(5)).await {
            if frame.len() == REQUEST_FRAME_LEN && frame[0] == CONTROL_MARKER {
                let mut reply = vec![CONTROL_MARKER];
                reply.extend_from_slice(params.as_bytes());
                let _ = gateway.write(&reply);
                break;
            }
        }
        gateway
    })
}

/// Serve parameters on every gateway end the factory creates
pub(crate) fn serve_all(
    mut gateways: mpsc::UnboundedReceiver<LoopbackChannel>,
    params: &'static str,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(gateway) = gateways.recv().await {
            serve_parameters(gateway, params);
        }
    })
}
