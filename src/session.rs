//! One connection attempt, from socket creation to forwarding
//!
//! A [`TunnelSession`] walks `Connecting -> Handshaking ->
//! NegotiatingParameters -> Forwarding` and ends with exactly one
//! [`SessionEvent::Terminated`]. Every failure stays inside the session and
//! surfaces only as a [`TerminalCause`]; the supervisor decides what happens
//! next.

use crate::cancel::CancelToken;
use crate::channel::transport::{knock, open_transport, resolve_gateway};
use crate::channel::{log_peer, SecureChannel};
use crate::config::{Config, TunnelSettings};
use crate::error::{Result, VpnError};
use crate::platform::Platform;
use crate::protocol::{request_parameters, ControlMessage};
use crate::tunnel::{ForwarderStats, PacketForwarder, StatsSnapshot, VirtualInterface};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifies one session attempt in logs and events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn next(self) -> Self {
        ConnectionId(self.0 + 1)
    }

    /// Log prefix, e.g. `[session 3]`
    pub fn tag(self) -> String {
        format!("[session {}]", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connecting,
    Handshaking,
    NegotiatingParameters,
    Forwarding,
    Terminated,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalCause {
    Cancelled,
    Transport,
    HandshakeFailed,
    Timeout,
    ConfigInvalid,
    IoFailure,
}

impl From<&VpnError> for TerminalCause {
    fn from(err: &VpnError) -> Self {
        match err {
            VpnError::Cancelled => TerminalCause::Cancelled,
            VpnError::Config(_) | VpnError::InvalidParameter { .. } => TerminalCause::ConfigInvalid,
            VpnError::Transport(_) => TerminalCause::Transport,
            VpnError::HandshakeFailed { .. } | VpnError::Tls(_) => TerminalCause::HandshakeFailed,
            VpnError::Timeout(_) => TerminalCause::Timeout,
            VpnError::TunTap(_) | VpnError::Io(_) | VpnError::InvalidState(_) => {
                TerminalCause::IoFailure
            }
        }
    }
}

impl fmt::Display for TerminalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TerminalCause::Cancelled => "cancelled",
            TerminalCause::Transport => "transport failure",
            TerminalCause::HandshakeFailed => "handshake failed",
            TerminalCause::Timeout => "timed out",
            TerminalCause::ConfigInvalid => "invalid configuration",
            TerminalCause::IoFailure => "I/O failure",
        };
        f.write_str(text)
    }
}

/// Session to supervisor notifications
#[derive(Debug)]
pub enum SessionEvent {
    StateChanged {
        id: ConnectionId,
        state: SessionState,
    },
    /// The interface is up and forwarding is about to start; sent at most
    /// once per session
    Established {
        id: ConnectionId,
        interface: Arc<dyn VirtualInterface>,
    },
    Terminated {
        id: ConnectionId,
        cause: TerminalCause,
        error: Option<String>,
        stats: Option<StatsSnapshot>,
    },
}

pub struct TunnelSession {
    id: ConnectionId,
    tag: String,
    config: Config,
    settings: TunnelSettings,
    platform: Platform,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancelToken,
    state: SessionState,
    channel: Option<Arc<dyn SecureChannel>>,
    established_reported: bool,
    stats: Option<Arc<ForwarderStats>>,
}

impl TunnelSession {
    pub fn new(
        id: ConnectionId,
        config: &Config,
        platform: Platform,
        events: mpsc::UnboundedSender<SessionEvent>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            id,
            tag: id.tag(),
            config: config.clone(),
            settings: config.settings(),
            platform,
            events,
            cancel,
            state: SessionState::Created,
            channel: None,
            established_reported: false,
            stats: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Run the session to completion and report how it ended
    pub async fn run(mut self) -> TerminalCause {
        let result = self.drive().await;

        let (cause, error) = match result {
            _ if self.cancel.is_cancelled() => (TerminalCause::Cancelled, None),
            Ok(()) => (TerminalCause::Cancelled, None),
            Err(e) => {
                let cause = TerminalCause::from(&e);
                if cause != TerminalCause::Cancelled {
                    log::warn!("{} Connection failed in {:?}: {e}", self.tag, self.state);
                }
                (cause, Some(e.to_string()))
            }
        };

        self.teardown(cause);
        let stats = self.stats.as_ref().map(|s| s.snapshot());
        self.enter(SessionState::Terminated);
        log::info!("{} Terminated: {cause}", self.tag);

        let _ = self.events.send(SessionEvent::Terminated {
            id: self.id,
            cause,
            error,
            stats,
        });
        cause
    }

    async fn drive(&mut self) -> Result<()> {
        self.enter(SessionState::Connecting);

        // Bad timing knobs or a bad port fail here, before any network I/O.
        self.config.validate()?;
        let port = self.config.gateway_port()?;
        let host = self.config.gateway.address.clone();
        let peer = resolve_gateway(&host, port).await?;
        log::info!("{} Connecting to {host} ({peer})", self.tag);

        let socket = open_transport(peer, self.platform.protector.as_ref())?;
        knock(&socket, &self.settings, &self.cancel).await?;

        self.enter(SessionState::Handshaking);
        let channel = self
            .platform
            .channels
            .create(socket, &self.platform.trust)?;
        self.channel = Some(channel.clone());

        let connecting = {
            let channel = channel.clone();
            tokio::task::spawn_blocking(move || channel.connect(peer))
        };
        tokio::select! {
            _ = self.cancel.cancelled() => {
                channel.shutdown();
                return Err(VpnError::Cancelled);
            }
            _ = tokio::time::sleep(self.settings.connect_timeout) => {
                channel.shutdown();
                return Err(VpnError::Timeout(format!(
                    "secure channel handshake with {peer}"
                )));
            }
            joined = connecting => {
                joined
                    .map_err(|e| VpnError::InvalidState(format!("Handshake task failed: {e}")))??;
            }
        }
        log::info!("{} Secure channel established", self.tag);
        log_peer(&self.tag, &channel.peer_identity());

        self.enter(SessionState::NegotiatingParameters);
        let params = request_parameters(channel.as_ref(), &self.settings, &self.cancel).await?;

        let provisioner = self.platform.provisioner.clone();
        let session_name = self.config.gateway.session_name.clone();
        let interface = tokio::task::spawn_blocking(move || {
            provisioner.establish(&params, &session_name)
        })
        .await
        .map_err(|e| VpnError::InvalidState(format!("Provisioning task failed: {e}")))??;

        self.enter(SessionState::Forwarding);
        self.report_established(interface.clone());

        let forwarder =
            PacketForwarder::new(channel, interface, self.settings.clone()).with_tag(&self.tag);
        self.stats = Some(forwarder.stats());
        forwarder.run(&self.cancel).await
    }

    fn enter(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        log::debug!("{} {:?} -> {:?}", self.tag, self.state, state);
        self.state = state;
        let _ = self.events.send(SessionEvent::StateChanged { id: self.id, state });
    }

    fn report_established(&mut self, interface: Arc<dyn VirtualInterface>) {
        if self.established_reported {
            return;
        }
        self.established_reported = true;
        log::info!("{} Established on {}", self.tag, interface.name());
        let _ = self.events.send(SessionEvent::Established {
            id: self.id,
            interface,
        });
    }

    /// Release the channel. The interface is left to the supervisor.
    fn teardown(&mut self, cause: TerminalCause) {
        let Some(channel) = self.channel.take() else {
            return;
        };

        if cause == TerminalCause::Cancelled && self.state == SessionState::Forwarding {
            let notice = ControlMessage::WantDisconnect.frame();
            for _ in 0..self.settings.disconnect_notice_repeats {
                if let Err(e) = channel.write(&notice) {
                    log::debug!("{} Disconnect notice not sent: {e}", self.tag);
                    break;
                }
            }
        }
        channel.shutdown();
    }
}
