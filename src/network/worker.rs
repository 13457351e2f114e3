//! Session worker
//!
//! One task per admitted participant. It broadcasts the roster to its participant
//! every tick, applies whatever the participant sends, and tears the session down
//! on quit, send failure, silence or server shutdown.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use super::registry::SessionLease;
use super::NetworkConfig;
use crate::protocol::{Identity, Message};

/// Lifecycle of a session worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Broadcasting and receiving
    Active,
    /// Leaving the loop; the roster entry still exists
    Terminating,
    /// Roster entry removed
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepartureReason {
    /// The participant sent a quit signal
    Quit,
    /// Sending the roster to the participant failed
    SendFailed(String),
    /// Nothing usable arrived for longer than the idle timeout
    IdleTimeout,
    /// The server is shutting down
    ServerShutdown,
}

impl fmt::Display for DepartureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepartureReason::Quit => write!(f, "quit"),
            DepartureReason::SendFailed(e) => write!(f, "send failed: {}", e),
            DepartureReason::IdleTimeout => write!(f, "idle timeout"),
            DepartureReason::ServerShutdown => write!(f, "server shutdown"),
        }
    }
}

/// Result of a finished worker, reported to the supervisor
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub identity: Identity,
    pub addr: SocketAddr,
    /// Last known display name
    pub name: String,
    pub reason: DepartureReason,
}

/// Per-participant session task
pub struct SessionWorker {
    lease: SessionLease,
    inbox: mpsc::Receiver<Vec<u8>>,
    socket: Arc<UdpSocket>,
    tick: Duration,
    idle_timeout: Option<Duration>,
    shutdown: watch::Receiver<bool>,
    last_heard: Instant,
    state: WorkerState,
    /// An oversized update has already been reported
    oversize_reported: bool,
}

impl SessionWorker {
    pub fn new(
        lease: SessionLease,
        inbox: mpsc::Receiver<Vec<u8>>,
        socket: Arc<UdpSocket>,
        config: &NetworkConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            lease,
            inbox,
            socket,
            tick: config.tick_interval(),
            idle_timeout: config.idle_timeout(),
            shutdown,
            last_heard: Instant::now(),
            state: WorkerState::Active,
            oversize_reported: false,
        }
    }

    pub fn identity(&self) -> Identity {
        self.lease.identity()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run until the session closes
    pub async fn run(mut self) -> WorkerExit {
        let identity = self.lease.identity();
        let addr = self.lease.addr();
        tracing::debug!(identity, %addr, "Session worker started");

        let reason = self.run_active().await;

        self.state = WorkerState::Terminating;
        tracing::debug!(identity, %addr, %reason, "Session terminating");

        let name = self
            .lease
            .current()
            .map(|state| state.name)
            .unwrap_or_default();

        let Self { lease, .. } = self;
        drop(lease);

        tracing::debug!(identity, %addr, state = ?WorkerState::Closed, "Session closed");

        WorkerExit {
            identity,
            addr,
            name,
            reason,
        }
    }

    async fn run_active(&mut self) -> DepartureReason {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        if *self.shutdown.borrow_and_update() {
            return DepartureReason::ServerShutdown;
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.broadcast().await {
                        return DepartureReason::SendFailed(e.to_string());
                    }
                    if let Some(timeout) = self.idle_timeout {
                        if self.last_heard.elapsed() >= timeout {
                            return DepartureReason::IdleTimeout;
                        }
                    }
                }

                datagram = self.inbox.recv() => {
                    match datagram {
                        Some(payload) => {
                            if let Some(reason) = self.interpret(&payload) {
                                return reason;
                            }
                        }
                        // The router only lets go of inboxes when the server stops
                        None => return DepartureReason::ServerShutdown,
                    }
                }

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return DepartureReason::ServerShutdown;
                    }
                }
            }
        }
    }

    /// Send the full roster to this participant
    async fn broadcast(&self) -> std::io::Result<()> {
        let payload = match Message::Roster(self.lease.roster()).encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(identity = self.lease.identity(), "Roster not sent: {}", e);
                return Ok(());
            }
        };

        self.socket.send_to(&payload, self.lease.addr()).await?;
        Ok(())
    }

    /// Apply one datagram from the participant
    fn interpret(&mut self, payload: &[u8]) -> Option<DepartureReason> {
        let message = match Message::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::trace!(identity = self.lease.identity(), "Discarding datagram: {}", e);
                return None;
            }
        };

        self.last_heard = Instant::now();

        match message {
            Message::StateUpdate(state) => {
                if let Err(e) = self.lease.update(state) {
                    let identity = self.lease.identity();
                    if self.oversize_reported {
                        tracing::trace!(identity, "State update refused: {}", e);
                    } else {
                        tracing::warn!(identity, "State update refused, keeping previous state: {}", e);
                        self.oversize_reported = true;
                    }
                }
            }
            Message::Quit => return Some(DepartureReason::Quit),
            other => {
                tracing::trace!(identity = self.lease.identity(), kind = other.kind(), "Accepted");
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Admission, SessionRegistry};
    use crate::protocol::{ParticipantState, Rect, Roster};

    struct Harness {
        registry: Arc<SessionRegistry>,
        peer: UdpSocket,
        inbox: mpsc::Sender<Vec<u8>>,
        shutdown: watch::Sender<bool>,
        worker: tokio::task::JoinHandle<WorkerExit>,
    }

    async fn start(idle_timeout_ms: Option<u64>) -> Harness {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let registry = SessionRegistry::new(2);
        let initial = ParticipantState::new("alice", Rect::new(0, 0, 10, 10), 0, false);
        let Admission::Admitted(lease, inbox_rx) = registry.admit(peer_addr, initial) else {
            panic!("expected admission");
        };
        let inbox = registry.inbox_for(&peer_addr).unwrap();

        let config = NetworkConfig {
            idle_timeout_ms,
            ..NetworkConfig::default()
        };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = SessionWorker::new(lease, inbox_rx, server, &config, shutdown_rx);
        assert_eq!(worker.state(), WorkerState::Active);

        Harness {
            registry,
            peer,
            inbox,
            shutdown,
            worker: tokio::spawn(worker.run()),
        }
    }

    async fn next_roster(peer: &UdpSocket) -> Roster {
        let mut buf = [0u8; 2048];
        loop {
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
                .await
                .expect("no broadcast")
                .unwrap();
            if let Ok(Message::Roster(roster)) = Message::decode(&buf[..n]) {
                return roster;
            }
        }
    }

    #[tokio::test]
    async fn test_broadcasts_roster_to_participant() {
        let h = start(None).await;

        let roster = next_roster(&h.peer).await;
        assert_eq!(roster[&0].name, "alice");
        assert_eq!(roster[&0].id, Some(0));
    }

    #[tokio::test]
    async fn test_state_update_reaches_next_broadcast() {
        let h = start(None).await;
        let moved = ParticipantState::new("alice", Rect::new(40, 12, 10, 10), 2, true);
        h.inbox
            .send(Message::StateUpdate(moved.clone()).encode().unwrap())
            .await
            .unwrap();

        loop {
            let roster = next_roster(&h.peer).await;
            if roster[&0].rect == moved.rect {
                assert_eq!(roster[&0], moved.with_id(0));
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_malformed_datagram_changes_nothing() {
        let h = start(None).await;
        let before = next_roster(&h.peer).await;

        h.inbox.send(b"{\"name\": \"trunc".to_vec()).await.unwrap();
        h.inbox.send(vec![0xde, 0xad, 0xbe, 0xef]).await.unwrap();

        // two ticks later the worker is still alive and saying the same thing
        next_roster(&h.peer).await;
        let after = next_roster(&h.peer).await;
        assert_eq!(before, after);
        assert!(!h.worker.is_finished());
    }

    #[tokio::test]
    async fn test_quit_closes_session() {
        let h = start(None).await;
        h.inbox.send(Message::Ping.encode().unwrap()).await.unwrap();
        h.inbox.send(Message::Quit.encode().unwrap()).await.unwrap();

        let exit = h.worker.await.unwrap();
        assert_eq!(exit.reason, DepartureReason::Quit);
        assert_eq!(exit.identity, 0);
        assert_eq!(exit.name, "alice");
        assert_eq!(h.registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_participant_times_out() {
        let h = start(Some(50)).await;

        let exit = tokio::time::timeout(Duration::from_secs(2), h.worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.reason, DepartureReason::IdleTimeout);
        assert!(h.registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_worker() {
        let h = start(None).await;
        h.shutdown.send(true).unwrap();

        let exit = h.worker.await.unwrap();
        assert_eq!(exit.reason, DepartureReason::ServerShutdown);
        assert_eq!(h.registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_update_keeps_broadcasts_flowing() {
        let h = start(None).await;
        let bob_initial = ParticipantState::new("bob", Rect::new(0, 0, 10, 10), 1, false);
        let Admission::Admitted(bob, _bob_inbox) =
            h.registry.admit(SocketAddr::from(([127, 0, 0, 1], 9)), bob_initial)
        else {
            panic!("expected admission");
        };
        let long_name = "x".repeat(1100);
        bob.update(ParticipantState::new(long_name.clone(), Rect::new(0, 0, 10, 10), 1, false))
            .unwrap();

        let too_much = ParticipantState::new(long_name, Rect::new(5, 5, 10, 10), 0, false);
        h.inbox
            .send(Message::StateUpdate(too_much).encode().unwrap())
            .await
            .unwrap();

        // the refused update leaves alice as she was and the roster still goes out
        for _ in 0..3 {
            let roster = next_roster(&h.peer).await;
            assert_eq!(roster[&0].name, "alice");
            assert_eq!(roster[&1].name.len(), 1100);
        }
        assert!(!h.worker.is_finished());
    }

    #[tokio::test]
    async fn test_send_failure_ends_session() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        // an IPv6 destination cannot be reached from an IPv4 socket
        let unreachable: SocketAddr = "[::1]:5000".parse().unwrap();

        let registry = SessionRegistry::new(1);
        let initial = ParticipantState::new("ghost", Rect::new(0, 0, 10, 10), 0, false);
        let Admission::Admitted(lease, inbox) = registry.admit(unreachable, initial) else {
            panic!("expected admission");
        };
        let (_shutdown, shutdown_rx) = watch::channel(false);
        let worker = SessionWorker::new(lease, inbox, server, &NetworkConfig::default(), shutdown_rx);

        let exit = tokio::time::timeout(Duration::from_secs(2), worker.run())
            .await
            .unwrap();
        assert!(matches!(exit.reason, DepartureReason::SendFailed(_)));
        assert_eq!(exit.name, "ghost");
        assert_eq!(registry.active_count(), 0);
    }
}
