//! Steady-state packet pump between the virtual interface and the channel
//!
//! The pump task drains the interface into the channel and paces the
//! keepalives; a reader task drains the channel into the interface. Both
//! sleep one idle interval per pass and stop as soon as either side fails
//! or the session is cancelled.

use super::VirtualInterface;
use crate::cancel::CancelToken;
use crate::channel::SecureChannel;
use crate::config::TunnelSettings;
use crate::error::{ChannelError, Result, VpnError};
use crate::protocol::{classify, keepalive_frame, FrameKind, CONTROL_MARKER, MAX_PACKET_SIZE};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Packets moved per direction before yielding
const MAX_BATCH: usize = 64;

/// Traffic counters shared by the pump and the reader
#[derive(Debug, Default)]
pub struct ForwarderStats {
    packets_out: AtomicU64,
    bytes_out: AtomicU64,
    packets_in: AtomicU64,
    bytes_in: AtomicU64,
    control_in: AtomicU64,
    control_out: AtomicU64,
    keepalive_bursts: AtomicU64,
    dropped_out: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_out: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub bytes_in: u64,
    pub control_in: u64,
    pub control_out: u64,
    pub keepalive_bursts: u64,
    pub dropped_out: u64,
}

impl ForwarderStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            control_in: self.control_in.load(Ordering::Relaxed),
            control_out: self.control_out.load(Ordering::Relaxed),
            keepalive_bursts: self.keepalive_bursts.load(Ordering::Relaxed),
            dropped_out: self.dropped_out.load(Ordering::Relaxed),
        }
    }

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "out {} pkts/{} bytes, in {} pkts/{} bytes, control in {} out {}, {} keepalive bursts, {} dropped",
            self.packets_out,
            self.bytes_out,
            self.packets_in,
            self.bytes_in,
            self.control_in,
            self.control_out,
            self.keepalive_bursts,
            self.dropped_out
        )
    }
}

pub struct PacketForwarder {
    channel: Arc<dyn SecureChannel>,
    interface: Arc<dyn VirtualInterface>,
    settings: TunnelSettings,
    stats: Arc<ForwarderStats>,
    tag: String,
}

impl PacketForwarder {
    pub fn new(
        channel: Arc<dyn SecureChannel>,
        interface: Arc<dyn VirtualInterface>,
        settings: TunnelSettings,
    ) -> Self {
        Self {
            channel,
            interface,
            settings,
            stats: Arc::new(ForwarderStats::default()),
            tag: String::from("[forwarder]"),
        }
    }

    /// Log prefix for this forwarder's lines
    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_string();
        self
    }

    pub fn stats(&self) -> Arc<ForwarderStats> {
        self.stats.clone()
    }

    /// Forward until cancelled or until either endpoint fails.
    ///
    /// Always ends in an error: [`VpnError::Cancelled`] when `cancel` fired,
    /// otherwise the I/O failure that stopped the loop. The reader task is
    /// stopped and joined before this returns.
    pub async fn run(self, cancel: &CancelToken) -> Result<()> {
        let reader_stop = CancelToken::new();
        let mut reader = tokio::spawn(read_channel(
            self.channel.clone(),
            self.interface.clone(),
            self.settings.idle_interval,
            self.stats.clone(),
            self.tag.clone(),
            reader_stop.clone(),
        ));

        let pumped = self.pump(cancel, &mut reader).await;
        reader_stop.cancel();

        match pumped {
            Pumped::ReaderDone => match reader.await {
                Ok(Ok(())) => Err(VpnError::Cancelled),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(VpnError::InvalidState(format!("Reader task failed: {e}"))),
            },
            Pumped::Stopped(err) => {
                if let Err(e) = reader.await {
                    log::warn!("{} Reader task failed: {e}", self.tag);
                }
                Err(err)
            }
        }
    }

    async fn pump(
        &self,
        cancel: &CancelToken,
        reader: &mut tokio::task::JoinHandle<Result<()>>,
    ) -> Pumped {
        let threshold = self.settings.keepalive_threshold();
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let mut ticks: u64 = 0;

        log::debug!("{} Forwarding started", self.tag);
        loop {
            if reader.is_finished() {
                return Pumped::ReaderDone;
            }

            if let Err(e) = self.drain_interface(&mut buf) {
                return Pumped::Stopped(e);
            }

            ticks += 1;
            if ticks > threshold {
                if let Err(e) = self.send_keepalives() {
                    return Pumped::Stopped(e);
                }
                ticks = 0;
            }

            if !cancel.sleep(self.settings.idle_interval).await {
                return Pumped::Stopped(VpnError::Cancelled);
            }
        }
    }

    fn drain_interface(&self, buf: &mut [u8]) -> Result<()> {
        for _ in 0..MAX_BATCH {
            let n = match self.interface.read(buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(VpnError::Io(e)),
            };
            let packet = &buf[..n];

            if packet[0] == CONTROL_MARKER {
                log::warn!(
                    "{} Dropping {n}-byte outgoing packet with a zero first byte",
                    self.tag
                );
                ForwarderStats::add(&self.stats.dropped_out, 1);
                continue;
            }

            self.channel.write(packet)?;
            log::trace!("{} -> {n} bytes", self.tag);
            ForwarderStats::add(&self.stats.packets_out, 1);
            ForwarderStats::add(&self.stats.bytes_out, n as u64);
        }
        Ok(())
    }

    fn send_keepalives(&self) -> Result<()> {
        let frame = keepalive_frame();
        for _ in 0..self.settings.keepalive_burst {
            self.channel.write(&frame)?;
        }
        log::trace!(
            "{} Sent {} keepalive frames",
            self.tag,
            self.settings.keepalive_burst
        );
        ForwarderStats::add(&self.stats.control_out, u64::from(self.settings.keepalive_burst));
        ForwarderStats::add(&self.stats.keepalive_bursts, 1);
        Ok(())
    }
}

enum Pumped {
    /// The reader task ended on its own; its result decides the outcome
    ReaderDone,
    Stopped(VpnError),
}

async fn read_channel(
    channel: Arc<dyn SecureChannel>,
    interface: Arc<dyn VirtualInterface>,
    idle: std::time::Duration,
    stats: Arc<ForwarderStats>,
    tag: String,
    stop: CancelToken,
) -> Result<()> {
    loop {
        for _ in 0..MAX_BATCH {
            let frame = match channel.read(MAX_PACKET_SIZE) {
                Ok(frame) => frame,
                Err(ChannelError::WouldBlock) => break,
                Err(e) => {
                    log::warn!("{tag} Channel read failed: {e}");
                    return Err(e.into());
                }
            };

            match classify(&frame) {
                FrameKind::Control => {
                    log::trace!("{tag} Control frame: {}", hex::encode(&frame));
                    ForwarderStats::add(&stats.control_in, 1);
                }
                FrameKind::Data => {
                    interface.write(&frame).map_err(|e| {
                        log::warn!("{tag} Interface write failed: {e}");
                        VpnError::Io(e)
                    })?;
                    log::trace!("{tag} <- {} bytes", frame.len());
                    ForwarderStats::add(&stats.packets_in, 1);
                    ForwarderStats::add(&stats.bytes_in, frame.len() as u64);
                }
            }
        }

        if !stop.sleep(idle).await {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LoopbackChannel;
    use crate::testing::fast_settings;
    use crate::tunnel::MemoryInterface;
    use bytes::Bytes;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    /// Minimal IPv4/UDP packet: 10.0.0.2:5000 -> 8.8.8.8:53, 4 payload bytes
    fn ipv4_packet() -> Vec<u8> {
        vec![
            0x45, 0x00, 0x00, 0x20, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0x0a, 0x00,
            0x00, 0x02, 0x08, 0x08, 0x08, 0x08, 0x13, 0x88, 0x00, 0x35, 0x00, 0x0c, 0x00, 0x00,
            0xde, 0xad, 0xbe, 0xef,
        ]
    }

    struct Rig {
        gateway: LoopbackChannel,
        interface: Arc<MemoryInterface>,
        cancel: CancelToken,
        stats: Arc<ForwarderStats>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    fn start(settings: TunnelSettings) -> Rig {
        let (client, gateway) = LoopbackChannel::pair();
        let interface = Arc::new(MemoryInterface::new("mem0"));
        let forwarder = PacketForwarder::new(Arc::new(client), interface.clone(), settings);
        let stats = forwarder.stats();
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { forwarder.run(&token).await });
        Rig {
            gateway,
            interface,
            cancel,
            stats,
            task,
        }
    }

    #[tokio::test]
    async fn test_control_frames_are_discarded_and_data_written_verbatim() {
        let rig = start(fast_settings());
        rig.gateway.write(&[0x00]).unwrap();
        let data = [0x01u8; 64];
        rig.gateway.write(&data).unwrap();

        let delivered = rig.interface.recv_delivered(WAIT).await.unwrap();
        assert_eq!(delivered.as_ref(), &data[..]);

        rig.cancel.cancel();
        let err = rig.task.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(rig.interface.take_delivered().is_empty());

        let stats = rig.stats.snapshot();
        assert_eq!(stats.control_in, 1);
        assert_eq!(stats.packets_in, 1);
        assert_eq!(stats.bytes_in, 64);
    }

    #[tokio::test]
    async fn test_ip_packet_round_trip_is_byte_exact() {
        let rig = start(fast_settings());
        let packet = ipv4_packet();

        rig.interface.inject(&packet);
        let sent = rig.gateway.recv(WAIT).await.unwrap();
        assert_eq!(sent.as_ref(), &packet[..]);

        let mut reply = packet.clone();
        reply[12..16].copy_from_slice(&[8, 8, 8, 8]);
        reply[16..20].copy_from_slice(&[10, 0, 0, 2]);
        rig.gateway.write(&reply).unwrap();
        let received = rig.interface.recv_delivered(WAIT).await.unwrap();
        assert_eq!(received, Bytes::from(reply));

        rig.cancel.cancel();
        assert!(rig.task.await.unwrap().unwrap_err().is_cancelled());
        let stats = rig.stats.snapshot();
        assert_eq!(stats.packets_out, 1);
        assert_eq!(stats.bytes_out, packet.len() as u64);
    }

    #[tokio::test]
    async fn test_keepalive_burst() {
        let settings = TunnelSettings {
            keepalive_interval: Duration::from_millis(10),
            keepalive_burst: 3,
            ..fast_settings()
        };
        let rig = start(settings);

        for _ in 0..3 {
            let frame = rig.gateway.recv(WAIT).await.unwrap();
            assert_eq!(frame.as_ref(), &[CONTROL_MARKER]);
        }
        rig.cancel.cancel();
        assert!(rig.task.await.unwrap().unwrap_err().is_cancelled());
        assert!(rig.stats.snapshot().keepalive_bursts >= 1);
    }

    #[tokio::test]
    async fn test_zero_led_outgoing_packet_is_dropped() {
        let rig = start(fast_settings());
        rig.interface.inject(&[0x00, 0x01, 0x02]);
        rig.interface.inject(&ipv4_packet());

        let sent = rig.gateway.recv(WAIT).await.unwrap();
        assert_eq!(sent.as_ref(), &ipv4_packet()[..]);
        rig.cancel.cancel();
        let _ = rig.task.await.unwrap();

        assert_eq!(rig.gateway.pending(), 0);
        assert_eq!(rig.stats.snapshot().dropped_out, 1);
    }

    #[tokio::test]
    async fn test_interface_write_failure_is_fatal() {
        let rig = start(fast_settings());
        rig.interface.close();
        rig.gateway.write(&ipv4_packet()).unwrap();

        let err = tokio::time::timeout(WAIT, rig.task).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, VpnError::Io(_)));
    }

    #[tokio::test]
    async fn test_channel_loss_is_fatal() {
        let rig = start(fast_settings());
        rig.gateway.shutdown();

        let err = tokio::time::timeout(WAIT, rig.task).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, VpnError::Io(_)));
        assert!(!rig.cancel.is_cancelled());
    }
}
