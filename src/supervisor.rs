//! Connection supervisor: owns the active session and the reconnect policy
//!
//! The supervisor runs as a single tokio task. Commands arrive from
//! [`SupervisorHandle`]s, session progress arrives as [`SessionEvent`]s, and
//! lifecycle [`Signal`]s go out to whoever is bound. Only this task decides
//! whether to retry, give up, or tell the UI anything.

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{Result, VpnError};
use crate::platform::Platform;
use crate::session::{ConnectionId, SessionEvent, SessionState, TerminalCause, TunnelSession};
use crate::tunnel::{InterfaceSlot, VirtualInterface};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Handshaking,
    Established,
    Reconnecting,
    Disconnecting,
    Failed,
}

/// Failed attempts since the last established connection, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryCounter {
    count: u32,
    max: u32,
}

impl RetryCounter {
    pub fn new(max: u32) -> Self {
        Self { count: 0, max }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_exhausted(&self) -> bool {
        self.count >= self.max
    }

    /// Count a failed attempt; `true` if another attempt is allowed
    pub fn record_failure(&mut self) -> bool {
        self.count = (self.count + 1).min(self.max);
        !self.is_exhausted()
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Give up: no attempts left until the next reset
    pub fn exhaust(&mut self) {
        self.count = self.max;
    }
}

/// Reason code carried by every [`Signal`]
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    UserRequested = 0,
    Established = 1,
    NeverEstablished = 2,
    RetriesExhausted = 3,
    ServiceStopped = 4,
}

impl Reason {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Reason::UserRequested => "user requested",
            Reason::Established => "established",
            Reason::NeverEstablished => "never established",
            Reason::RetriesExhausted => "retries exhausted",
            Reason::ServiceStopped => "service stopped",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Bound,
    Unbound,
    Connecting,
    Connected,
    Disconnected,
    ConnectFailed,
    ServiceStopping,
}

/// Lifecycle notification for the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub kind: SignalKind,
    pub reason: Reason,
}

impl Signal {
    pub fn new(kind: SignalKind, reason: Reason) -> Self {
        Self { kind, reason }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({}: {})", self.kind, self.reason.code(), self.reason)
    }
}

/// Point-in-time view of the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub connection_id: Option<ConnectionId>,
    pub interface: Option<String>,
}

enum Command {
    Connect,
    Disconnect,
    InterruptReconnect,
    UpdateConfig(Box<Config>),
    Bind(mpsc::UnboundedSender<Signal>),
    Unbind,
    Status(oneshot::Sender<Status>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle for driving a running supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    interrupt: Arc<AtomicBool>,
}

impl SupervisorHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| VpnError::InvalidState("Supervisor has stopped".to_string()))
    }

    /// User-initiated connect: resets the retry budget and starts a fresh
    /// session, replacing any current one
    pub fn connect(&self) -> Result<()> {
        self.send(Command::Connect)
    }

    /// User-initiated disconnect; no further attempts are made
    pub fn disconnect(&self) -> Result<()> {
        self.interrupt.store(true, Ordering::SeqCst);
        self.send(Command::Disconnect)
    }

    /// Stop reconnecting once the current attempt ends, without cancelling it
    pub fn interrupt_reconnect(&self) -> Result<()> {
        self.interrupt.store(true, Ordering::SeqCst);
        self.send(Command::InterruptReconnect)
    }

    /// Configuration used by the next session
    ///
    /// # Errors
    ///
    /// Returns [`VpnError::Config`] when `config` fails validation; the
    /// supervisor keeps its current configuration.
    pub fn update_config(&self, config: Config) -> Result<()> {
        config.validate()?;
        self.send(Command::UpdateConfig(Box::new(config)))
    }

    pub fn bind(&self, sink: mpsc::UnboundedSender<Signal>) -> Result<()> {
        self.send(Command::Bind(sink))
    }

    pub fn unbind(&self) -> Result<()> {
        self.send(Command::Unbind)
    }

    /// Current state, retry count, session id and interface
    ///
    /// # Errors
    ///
    /// Returns [`VpnError::InvalidState`] once the supervisor has stopped.
    pub async fn status(&self) -> Result<Status> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx))?;
        rx.await
            .map_err(|_| VpnError::InvalidState("Supervisor has stopped".to_string()))
    }

    pub async fn state(&self) -> Result<ConnectionState> {
        Ok(self.status().await?.state)
    }

    pub async fn retry_count(&self) -> Result<u32> {
        Ok(self.status().await?.retry_count)
    }

    /// Emit `ServiceStopping`, end the current session, release the
    /// interface and stop the supervisor task
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await
            .map_err(|_| VpnError::InvalidState("Supervisor has stopped".to_string()))
    }
}

struct ActiveSession {
    id: ConnectionId,
    cancel: CancelToken,
    task: JoinHandle<TerminalCause>,
}

pub struct ConnectionSupervisor {
    config: Config,
    platform: Platform,
    state: ConnectionState,
    retries: RetryCounter,
    interrupt: Arc<AtomicBool>,
    announced: bool,
    ever_established: bool,
    last_id: ConnectionId,
    installed: Option<ConnectionId>,
    current: Option<ActiveSession>,
    interface: InterfaceSlot,
    sink: Option<mpsc::UnboundedSender<Signal>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl ConnectionSupervisor {
    /// Start the supervisor task; it stays idle until `connect`
    ///
    /// # Errors
    ///
    /// Returns [`VpnError::Config`] when `config` fails validation.
    pub fn spawn(config: Config, platform: Platform) -> Result<SupervisorHandle> {
        config.validate()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let interrupt = Arc::new(AtomicBool::new(false));

        let supervisor = ConnectionSupervisor::new(config, platform, interrupt.clone());
        tokio::spawn(supervisor.run(commands_rx));

        Ok(SupervisorHandle {
            commands: commands_tx,
            interrupt,
        })
    }

    fn new(config: Config, platform: Platform, interrupt: Arc<AtomicBool>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        ConnectionSupervisor {
            retries: RetryCounter::new(config.tunnel.max_reconnect_attempts),
            config,
            platform,
            state: ConnectionState::Idle,
            interrupt,
            announced: false,
            ever_established: false,
            last_id: ConnectionId(0),
            installed: None,
            current: None,
            interface: InterfaceSlot::new(),
            sink: None,
            events_tx,
            events_rx,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        log::debug!("Supervisor started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
            }
        }
        log::debug!("Supervisor stopped");
    }

    /// Returns `false` once the supervisor should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect => {
                log::info!("Connect requested");
                self.retries.reset();
                self.interrupt.store(false, Ordering::SeqCst);
                self.announced = false;
                self.ever_established = false;
                self.set_state(ConnectionState::Connecting);
                self.emit(SignalKind::Connecting, Reason::UserRequested);

                // The old session must be gone before a new one can touch the
                // interface; the interface itself stays until the new
                // session replaces it.
                self.stop_current().await;
                self.start_session();
            }
            Command::Disconnect => {
                log::info!("Disconnect requested");
                self.interrupt.store(true, Ordering::SeqCst);
                self.retries.exhaust();
                if let Some(cancel) = self.current.as_ref().map(|a| a.cancel.clone()) {
                    self.set_state(ConnectionState::Disconnecting);
                    cancel.cancel();
                } else if !matches!(self.state, ConnectionState::Idle | ConnectionState::Failed) {
                    self.finish_interrupted();
                }
            }
            Command::InterruptReconnect => {
                self.interrupt.store(true, Ordering::SeqCst);
                log::info!("Reconnect interrupted");
            }
            Command::UpdateConfig(config) => {
                self.retries = RetryCounter {
                    count: self.retries.count().min(config.tunnel.max_reconnect_attempts),
                    max: config.tunnel.max_reconnect_attempts,
                };
                self.config = *config;
            }
            Command::Bind(sink) => {
                let bound = Signal::new(SignalKind::Bound, Reason::UserRequested);
                if self.sink.is_none() {
                    log::debug!("Signal sink bound");
                    self.sink = Some(sink);
                    self.emit(bound.kind, bound.reason);
                } else {
                    let _ = sink.send(bound);
                }
            }
            Command::Unbind => {
                if let Some(sink) = self.sink.take() {
                    log::debug!("Signal sink unbound");
                    let _ = sink.send(Signal::new(SignalKind::Unbound, Reason::UserRequested));
                }
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown(ack) => {
                self.stop().await;
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged { id, state } if self.is_current(id) => {
                match state {
                    SessionState::Handshaking | SessionState::NegotiatingParameters => {
                        if self.state != ConnectionState::Disconnecting {
                            self.set_state(ConnectionState::Handshaking);
                        }
                    }
                    _ => {}
                }
            }
            SessionEvent::StateChanged { .. } => {}
            SessionEvent::Established { id, interface } => {
                if self.is_current(id) {
                    self.on_established(id, interface);
                } else {
                    log::debug!("Closing interface of stale session {id}");
                    interface.close();
                }
            }
            SessionEvent::Terminated {
                id,
                cause,
                error,
                stats,
            } => {
                if !self.is_current(id) {
                    log::debug!("Ignoring termination of stale session {id}");
                    return;
                }
                if let Some(active) = self.current.take() {
                    let _ = active.task.await;
                }
                if let Some(stats) = stats {
                    log::info!("{} Traffic: {stats}", id.tag());
                }
                self.on_terminated(id, cause, error);
            }
        }
    }

    fn on_established(&mut self, id: ConnectionId, interface: Arc<dyn VirtualInterface>) {
        if self.installed == Some(id) {
            log::debug!("{} Already established", id.tag());
            return;
        }
        self.installed = Some(id);
        self.interface.install(interface);
        self.retries.reset();
        self.ever_established = true;
        if self.state != ConnectionState::Disconnecting {
            self.set_state(ConnectionState::Established);
        }

        if !self.announced {
            self.announced = true;
            self.emit(SignalKind::Connected, Reason::Established);
        } else {
            log::info!("{} Reconnected", id.tag());
        }
    }

    fn on_terminated(&mut self, id: ConnectionId, cause: TerminalCause, error: Option<String>) {
        log::info!(
            "{} Session ended: {cause}{}",
            id.tag(),
            error.map(|e| format!(" ({e})")).unwrap_or_default()
        );

        if self.interrupt.load(Ordering::SeqCst) {
            self.retries.exhaust();
            self.finish_interrupted();
            return;
        }

        if self.retries.record_failure() {
            log::info!(
                "Reconnecting (attempt {}/{})",
                self.retries.count(),
                self.retries.max()
            );
            self.set_state(ConnectionState::Reconnecting);
            self.start_session();
        } else {
            log::warn!(
                "Giving up after {} failed attempts",
                self.retries.count()
            );
            self.interface.release();
            self.set_state(ConnectionState::Failed);
            self.emit(SignalKind::ConnectFailed, Reason::RetriesExhausted);
        }
    }

    /// Final signal after a user disconnect or an interrupted reconnect
    fn finish_interrupted(&mut self) {
        self.interface.release();
        self.set_state(ConnectionState::Idle);
        if self.ever_established {
            self.emit(SignalKind::Disconnected, Reason::UserRequested);
        } else {
            self.emit(SignalKind::ConnectFailed, Reason::NeverEstablished);
        }
    }

    fn start_session(&mut self) {
        self.last_id = self.last_id.next();
        let id = self.last_id;
        let cancel = CancelToken::new();
        let session = TunnelSession::new(
            id,
            &self.config,
            self.platform.clone(),
            self.events_tx.clone(),
            cancel.clone(),
        );
        log::debug!("{} Starting", id.tag());
        let task = tokio::spawn(session.run());
        self.current = Some(ActiveSession { id, cancel, task });
    }

    async fn stop_current(&mut self) {
        if let Some(active) = self.current.take() {
            log::debug!("{} Cancelling", active.id.tag());
            active.cancel.cancel();
            if let Err(e) = active.task.await {
                log::warn!("{} Session task failed: {e}", active.id.tag());
            }
        }
    }

    async fn stop(&mut self) {
        self.emit(SignalKind::ServiceStopping, Reason::ServiceStopped);
        self.interrupt.store(true, Ordering::SeqCst);
        self.stop_current().await;
        self.interface.release();
        self.set_state(ConnectionState::Idle);
    }

    fn is_current(&self, id: ConnectionId) -> bool {
        self.current.as_ref().map(|a| a.id) == Some(id)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::debug!("Connection state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn emit(&mut self, kind: SignalKind, reason: Reason) {
        let signal = Signal::new(kind, reason);
        log::info!("Signal: {signal}");
        if let Some(sink) = &self.sink {
            if sink.send(signal).is_err() {
                log::debug!("Signal sink went away");
                self.sink = None;
            }
        }
    }

    fn status(&self) -> Status {
        Status {
            state: self.state,
            retry_count: self.retries.count(),
            connection_id: self.current.as_ref().map(|a| a.id),
            interface: self.interface.current().map(|i| i.name().to_string()),
        }
    }
}
