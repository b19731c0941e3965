//! In-memory secure channel pair
//!
//! `LoopbackChannel::pair()` yields two connected ends: what one end writes,
//! the other reads. [`ScriptedFactory`] hands the client end to sessions and
//! the gateway end to the caller, with a scripted outcome for each connect.
//! Useful for exercising sessions without a real DTLS stack.

use super::{ChannelFactory, PeerInfo, SecureChannel};
use crate::crypto::TrustAnchor;
use crate::error::ChannelError;
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// What `connect` does on a scripted client end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Reject { code: i32, description: String },
    Timeout,
    Unreachable,
}

#[derive(Debug, Default)]
struct Pipe {
    frames: Mutex<VecDeque<Bytes>>,
}

impl Pipe {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Bytes>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One end of an in-memory datagram channel
#[derive(Debug)]
pub struct LoopbackChannel {
    inbound: Arc<Pipe>,
    outbound: Arc<Pipe>,
    closed: Arc<AtomicBool>,
    connected: AtomicBool,
    outcome: ConnectOutcome,
    socket: Option<UdpSocket>,
}

impl LoopbackChannel {
    /// Two connected ends sharing one lifetime: shutting down either closes both
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());
        let closed = Arc::new(AtomicBool::new(false));

        let a = Self {
            inbound: b_to_a.clone(),
            outbound: a_to_b.clone(),
            closed: closed.clone(),
            connected: AtomicBool::new(false),
            outcome: ConnectOutcome::Accept,
            socket: None,
        };
        let b = Self {
            inbound: a_to_b,
            outbound: b_to_a,
            closed,
            connected: AtomicBool::new(false),
            outcome: ConnectOutcome::Accept,
            socket: None,
        };
        (a, b)
    }

    /// Replace what `connect` will report
    pub fn with_outcome(mut self, outcome: ConnectOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Keep the transport socket alive for as long as this end lives
    pub fn holding_socket(mut self, socket: UdpSocket) -> Self {
        self.socket = Some(socket);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Frames waiting to be read on this end
    pub fn pending(&self) -> usize {
        self.inbound.lock().len()
    }

    /// Poll for the next frame until `wait` elapses
    pub async fn recv(&self, wait: Duration) -> Result<Bytes, ChannelError> {
        let deadline = Instant::now() + wait;
        loop {
            match self.read(usize::MAX) {
                Err(ChannelError::WouldBlock) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err(ChannelError::WouldBlock) => return Err(ChannelError::Timeout),
                other => return other,
            }
        }
    }
}

impl SecureChannel for LoopbackChannel {
    fn connect(&self, _peer: SocketAddr) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        match &self.outcome {
            ConnectOutcome::Accept => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            ConnectOutcome::Reject { code, description } => Err(ChannelError::HandshakeFailed {
                code: *code,
                description: description.clone(),
            }),
            ConnectOutcome::Timeout => Err(ChannelError::Timeout),
            ConnectOutcome::Unreachable => {
                Err(ChannelError::Unreachable("loopback peer unreachable".to_string()))
            }
        }
    }

    /// Frames already in flight stay readable after shutdown; `Closed` is
    /// reported once they are drained.
    fn read(&self, max_len: usize) -> Result<Bytes, ChannelError> {
        match self.inbound.lock().pop_front() {
            Some(frame) if frame.len() > max_len => Ok(frame.slice(..max_len)),
            Some(frame) => Ok(frame),
            None if self.is_closed() => Err(ChannelError::Closed),
            None => Err(ChannelError::WouldBlock),
        }
    }

    fn write(&self, frame: &[u8]) -> Result<usize, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.outbound.lock().push_back(Bytes::copy_from_slice(frame));
        Ok(frame.len())
    }

    fn peer_identity(&self) -> PeerInfo {
        PeerInfo {
            issuer: Some("CN=loopback root".to_string()),
            subject: Some("CN=loopback gateway".to_string()),
            alt_names: vec!["localhost".to_string()],
            protocol_version: "loopback".to_string(),
            cipher: "NULL".to_string(),
        }
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Channel factory whose connects follow a script
///
/// Each created client end takes the next scripted [`ConnectOutcome`]
/// (`Accept` once the script runs dry); the matching gateway end is delivered
/// on the receiver returned by [`ScriptedFactory::new`].
#[derive(Debug)]
pub struct ScriptedFactory {
    script: Mutex<VecDeque<ConnectOutcome>>,
    gateways: mpsc::UnboundedSender<LoopbackChannel>,
    created: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LoopbackChannel>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                script: Mutex::new(VecDeque::new()),
                gateways: tx,
                created: AtomicUsize::new(0),
            },
            rx,
        )
    }

    pub fn push_outcome(&self, outcome: ConnectOutcome) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }

    /// Number of channels handed out so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ChannelFactory for ScriptedFactory {
    fn create(
        &self,
        socket: UdpSocket,
        _trust: &TrustAnchor,
    ) -> Result<Arc<dyn SecureChannel>, ChannelError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(ConnectOutcome::Accept);

        let (client, gateway) = LoopbackChannel::pair();
        // Nobody listening for gateway ends is fine; the client still works.
        let _ = self.gateways.send(gateway);
        Ok(Arc::new(client.with_outcome(outcome).holding_socket(socket)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_delivers_frames_in_order() {
        let (a, b) = LoopbackChannel::pair();
        a.write(&[1, 2, 3]).unwrap();
        a.write(&[4]).unwrap();
        assert_eq!(b.pending(), 2);
        assert_eq!(b.read(1500).unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(b.read(1500).unwrap().as_ref(), &[4]);
        assert!(matches!(b.read(1500), Err(ChannelError::WouldBlock)));
        assert!(matches!(a.read(1500), Err(ChannelError::WouldBlock)));
    }

    #[test]
    fn test_read_truncates_to_max_len() {
        let (a, b) = LoopbackChannel::pair();
        a.write(&[9; 10]).unwrap();
        assert_eq!(b.read(4).unwrap().len(), 4);
    }

    #[test]
    fn test_shutdown_closes_both_ends() {
        let (a, b) = LoopbackChannel::pair();
        b.write(&[7]).unwrap();
        b.shutdown();
        assert_eq!(a.read(10).unwrap().as_ref(), &[7]);
        assert!(matches!(a.write(&[1]), Err(ChannelError::Closed)));
        assert!(matches!(a.read(10), Err(ChannelError::Closed)));
        assert!(a.is_closed());
    }

    #[test]
    fn test_scripted_outcomes() {
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (factory, mut gateways) = ScriptedFactory::new();
        factory.push_outcome(ConnectOutcome::Reject {
            code: 1,
            description: "bad certificate".into(),
        });
        let trust = TrustAnchor::webpki_roots();

        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let first = factory.create(socket, &trust).unwrap();
        assert!(matches!(
            first.connect(peer),
            Err(ChannelError::HandshakeFailed { code: 1, .. })
        ));

        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let second = factory.create(socket, &trust).unwrap();
        assert!(second.connect(peer).is_ok());
        assert_eq!(factory.created(), 2);

        let _ = gateways.try_recv().unwrap();
        let gateway = gateways.try_recv().unwrap();
        second.write(&[0x45, 0x00]).unwrap();
        assert_eq!(gateway.read(64).unwrap().as_ref(), &[0x45, 0x00]);
    }

    #[tokio::test]
    async fn test_recv_times_out() {
        let (_a, b) = LoopbackChannel::pair();
        let err = b.recv(Duration::from_millis(5)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Timeout));
    }
}
