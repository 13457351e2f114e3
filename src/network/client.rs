//! Rollcall Client
//!
//! Joins a server through its admission socket, then exchanges datagrams with the
//! session socket from a background task: the latest roster comes in, queued
//! messages go out one per tick.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{resolve_host, NetworkConfig};
use crate::protocol::{CodecError, Identity, Message, ParticipantState, Roster, MAX_DATAGRAM_SIZE};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Session closed; create a new client to reconnect")]
    SessionClosed,

    #[error("No handshake reply (server full or unreachable)")]
    Timeout,

    #[error("Unexpected handshake reply: {0}")]
    UnexpectedReply(&'static str),

    #[error("Outbound queue full")]
    QueueFull,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Handshaking,
    Connected { identity: Identity },
    Closed,
}

/// Rollcall Client
pub struct Client {
    /// Client configuration
    config: NetworkConfig,
    /// Latest local state, sent as the first-contact record
    local: ParticipantState,
    /// Current state
    state: ClientState,
    /// Why the last handshake failed
    unavailable: Option<String>,
    /// Latest roster from the server
    roster_rx: watch::Receiver<Roster>,
    /// Handed to the session task on connect
    roster_tx: Option<watch::Sender<Roster>>,
    /// Outbound queue (once connected)
    outbound_tx: Option<mpsc::Sender<Message>>,
    /// Shutdown signal for the session task
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Session task
    task: Option<JoinHandle<()>>,
}

impl Client {
    /// Create a new client
    pub fn new(config: NetworkConfig, local: ParticipantState) -> Self {
        let (roster_tx, roster_rx) = watch::channel(Roster::new());

        Self {
            config,
            local,
            state: ClientState::Disconnected,
            unavailable: None,
            roster_rx,
            roster_tx: Some(roster_tx),
            outbound_tx: None,
            shutdown_tx: None,
            task: None,
        }
    }

    /// Perform the handshake and start the session task
    ///
    /// On failure the client stays disconnected and may try again.
    pub async fn connect(&mut self) -> ClientResult<Identity> {
        match self.state {
            ClientState::Closed => return Err(ClientError::SessionClosed),
            ClientState::Handshaking | ClientState::Connected { .. } => {
                return Err(ClientError::AlreadyConnected)
            }
            ClientState::Disconnected => {}
        }

        let attempt = {
            let _handshaking = HandshakeGuard::enter(&mut self.state);
            handshake(&self.config, &self.local).await
        };

        let (socket, identity, session_addr) = match attempt {
            Ok(joined) => joined,
            Err(e) => {
                tracing::warn!("Multiplayer unavailable: {}", e);
                self.state = ClientState::Disconnected;
                self.unavailable = Some(e.to_string());
                return Err(e);
            }
        };

        let roster_tx = self.roster_tx.take().ok_or(ClientError::SessionClosed)?;
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        self.local.id = Some(identity);
        self.outbound_tx = Some(outbound_tx);
        self.shutdown_tx = Some(shutdown_tx);
        self.unavailable = None;
        self.state = ClientState::Connected { identity };

        tracing::info!("Joined {} as {}", session_addr, identity);

        self.task = Some(tokio::spawn(run_session(
            socket,
            session_addr,
            outbound_rx,
            roster_tx,
            shutdown_rx,
            self.config.tick_interval(),
        )));

        Ok(identity)
    }

    /// Stop the session task; it tells the server we quit
    pub async fn disconnect(&mut self) -> ClientResult<()> {
        if !matches!(self.state, ClientState::Connected { .. }) {
            return Err(ClientError::NotConnected);
        }

        self.outbound_tx = None;
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Session task failed: {}", e);
            }
        }

        self.state = ClientState::Closed;
        Ok(())
    }

    /// Queue a message for the server
    pub fn send(&self, message: impl Into<Message>) -> ClientResult<()> {
        let tx = self.outbound_tx.as_ref().ok_or(match self.state {
            ClientState::Closed => ClientError::SessionClosed,
            _ => ClientError::NotConnected,
        })?;

        tx.try_send(message.into()).map_err(|e| match e {
            TrySendError::Full(_) => ClientError::QueueFull,
            TrySendError::Closed(_) => ClientError::NotConnected,
        })
    }

    /// Queue a new local state, stamped with our identity
    pub fn send_state(&mut self, state: ParticipantState) -> ClientResult<()> {
        self.local = ParticipantState {
            id: self.identity(),
            ..state
        };
        self.send(self.local.clone())
    }

    /// Queue a liveness ping
    pub fn send_ping(&self) -> ClientResult<()> {
        self.send(Message::Ping)
    }

    /// Number of messages waiting to be sent
    pub fn queued(&self) -> usize {
        self.outbound_tx
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    /// Latest roster received from the server
    pub fn roster(&self) -> Roster {
        self.roster_rx.borrow().clone()
    }

    /// Watch for roster changes
    pub fn roster_receiver(&self) -> watch::Receiver<Roster> {
        self.roster_rx.clone()
    }

    /// Everyone in the latest roster except us
    pub fn remote_participants(&self) -> Vec<ParticipantState> {
        let own = self.identity();
        self.roster_rx
            .borrow()
            .iter()
            .filter(|&(&identity, _)| Some(identity) != own)
            .map(|(_, state)| state.clone())
            .collect()
    }

    pub fn identity(&self) -> Option<Identity> {
        match self.state {
            ClientState::Connected { identity } => Some(identity),
            _ => None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ClientState::Connected { .. })
    }

    /// Reason the last connection attempt failed, if it did
    pub fn unavailable_reason(&self) -> Option<&str> {
        self.unavailable.as_deref()
    }

    pub fn local_state(&self) -> &ParticipantState {
        &self.local
    }

    /// A ping timer using the configured interval
    pub fn ping_timer(&self) -> PingTimer {
        PingTimer::new(self.config.ping_interval_frames)
    }
}

async fn handshake(
    config: &NetworkConfig,
    local: &ParticipantState,
) -> ClientResult<(UdpSocket, Identity, SocketAddr)> {
    let admission_addr = resolve_host(&config.host, config.admission_port).await?;
    let session_addr = resolve_host(&config.host, config.session_port).await?;

    let bind_addr: SocketAddr = if admission_addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await?;

    tracing::debug!("Sending first contact to {}", admission_addr);
    let hello = Message::StateUpdate(local.clone()).encode()?;
    socket.send_to(&hello, admission_addr).await?;

    let identity = tokio::time::timeout(
        config.handshake_timeout(),
        await_reply(&socket, admission_addr),
    )
    .await
    .map_err(|_| ClientError::Timeout)??;

    Ok((socket, identity, session_addr))
}

/// Holds a client in `Handshaking`; falls back to `Disconnected` when dropped,
/// including when the `connect` future itself is dropped mid-handshake
struct HandshakeGuard<'a> {
    state: &'a mut ClientState,
}

impl<'a> HandshakeGuard<'a> {
    fn enter(state: &'a mut ClientState) -> Self {
        *state = ClientState::Handshaking;
        Self { state }
    }
}

impl Drop for HandshakeGuard<'_> {
    fn drop(&mut self) {
        if *self.state == ClientState::Handshaking {
            *self.state = ClientState::Disconnected;
        }
    }
}

async fn await_reply(socket: &UdpSocket, admission_addr: SocketAddr) -> ClientResult<Identity> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        if from != admission_addr {
            tracing::trace!("Ignoring datagram from {} during handshake", from);
            continue;
        }

        return match Message::decode(&buf[..n])? {
            Message::HandshakeReply { assigned_id } => Ok(assigned_id),
            other => Err(ClientError::UnexpectedReply(other.kind())),
        };
    }
}

async fn run_session(
    socket: UdpSocket,
    session_addr: SocketAddr,
    mut outbound: mpsc::Receiver<Message>,
    roster_tx: watch::Sender<Roster>,
    mut shutdown: oneshot::Receiver<()>,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            biased;

            // Also fires when the client is dropped
            _ = &mut shutdown => break,

            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, from)) if from == session_addr => match Message::decode(&buf[..n]) {
                        Ok(Message::Roster(roster)) => {
                            roster_tx.send_replace(roster);
                        }
                        Ok(other) => tracing::trace!(kind = other.kind(), "Ignoring message"),
                        Err(e) => tracing::trace!("Discarding datagram: {}", e),
                    },
                    Ok((_, from)) => tracing::trace!("Ignoring datagram from {}", from),
                    Err(e) => tracing::debug!("Receive error: {}", e),
                }
            }

            _ = ticker.tick() => {
                if let Ok(message) = outbound.try_recv() {
                    if let Err(e) = send_message(&socket, &message, session_addr).await {
                        tracing::warn!("Failed to send {}: {}", message.kind(), e);
                    }
                }
            }
        }
    }

    if let Err(e) = send_message(&socket, &Message::Quit, session_addr).await {
        tracing::warn!("Failed to send quit: {}", e);
    }
    tracing::info!("Session closed");
}

async fn send_message(socket: &UdpSocket, message: &Message, to: SocketAddr) -> ClientResult<()> {
    let payload = message.encode()?;
    socket.send_to(&payload, to).await?;
    Ok(())
}

/// Counts presentation frames and says when a keep-alive ping is due
#[derive(Debug, Clone)]
pub struct PingTimer {
    interval_frames: u32,
    frames: u32,
}

impl PingTimer {
    pub fn new(interval_frames: u32) -> Self {
        Self {
            interval_frames,
            frames: 0,
        }
    }

    /// Advance one frame; returns true when a ping should be queued
    pub fn tick(&mut self, state_changed: bool) -> bool {
        if state_changed {
            self.frames = 0;
            return false;
        }

        if self.frames < self.interval_frames {
            self.frames += 1;
            false
        } else {
            self.frames = 0;
            true
        }
    }
}
