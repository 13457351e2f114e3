//! Rollcall Server
//!
//! Two UDP sockets: the admission socket hands out identities to first-contact
//! datagrams, the session socket carries everything afterwards. A router task is
//! the only reader of the session socket and forwards each datagram to the worker
//! owning its source address.

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use super::registry::{Admission, SessionRegistry};
use super::worker::{DepartureReason, SessionWorker, WorkerExit};
use super::NetworkConfig;
use crate::protocol::{Identity, Message, ParticipantState, MAX_DATAGRAM_SIZE};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Both sockets bound, admission open
    Started {
        admission_addr: SocketAddr,
        session_addr: SocketAddr,
    },
    /// A participant was admitted
    ParticipantJoined {
        identity: Identity,
        addr: SocketAddr,
        name: String,
    },
    /// A participant's session closed
    ParticipantLeft {
        identity: Identity,
        addr: SocketAddr,
        name: String,
        reason: DepartureReason,
    },
    /// The admission socket was closed
    AdmissionClosed {
        active: usize,
    },
    /// Every session has closed
    Stopped,
}

/// Requests a running server to stop
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Rollcall Server
pub struct Server {
    /// Server configuration
    config: NetworkConfig,
    /// Socket receiving first-contact datagrams
    admission_socket: UdpSocket,
    /// Socket carrying steady-state traffic
    session_socket: Arc<UdpSocket>,
    /// Active sessions
    registry: Arc<SessionRegistry>,
    /// Event sender
    event_tx: mpsc::Sender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Bind both sockets
    ///
    /// Failing to bind is the one fatal server error.
    pub async fn bind(config: NetworkConfig) -> ServerResult<Self> {
        let session_socket = bind_socket(&config.host, config.session_port).await?;
        let admission_socket = bind_socket(&config.host, config.admission_port).await?;

        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            registry: SessionRegistry::new(config.max_clients),
            config,
            admission_socket,
            session_socket: Arc::new(session_socket),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    pub fn admission_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.admission_socket.local_addr()?)
    }

    pub fn session_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.session_socket.local_addr()?)
    }

    /// Shared view of the active sessions
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Serve until admission has closed and every session has ended, or until
    /// shutdown is requested
    pub async fn run(self) -> ServerResult<()> {
        let Server {
            config,
            admission_socket,
            session_socket,
            registry,
            event_tx,
            event_rx: _,
            shutdown_tx,
            mut shutdown_rx,
        } = self;

        let admission_addr = admission_socket.local_addr()?;
        let session_addr = session_socket.local_addr()?;
        tracing::info!(
            "Admission on {}, sessions on {} (capacity {})",
            admission_addr,
            session_addr,
            registry.capacity()
        );
        emit(
            &event_tx,
            ServerEvent::Started {
                admission_addr,
                session_addr,
            },
        );

        let router = tokio::spawn(route_datagrams(session_socket.clone(), registry.clone()));

        let mut workers = JoinSet::new();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        // Admission phase
        let mut stopping = *shutdown_rx.borrow_and_update();
        while !stopping && !(config.close_when_full && registry.is_full()) {
            tokio::select! {
                result = admission_socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, addr)) => {
                            admit(
                                &buf[..n],
                                addr,
                                &admission_socket,
                                &session_socket,
                                &registry,
                                &config,
                                &shutdown_tx,
                                &event_tx,
                                &mut workers,
                            )
                            .await;
                        }
                        Err(e) => {
                            tracing::debug!("Admission receive error: {}", e);
                        }
                    }
                }

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    report_exit(joined, &event_tx);
                }

                _ = shutdown_rx.changed() => {
                    stopping = true;
                    break;
                }
            }
        }

        drop(admission_socket);
        tracing::info!("Done accepting participants");
        emit(
            &event_tx,
            ServerEvent::AdmissionClosed {
                active: registry.active_count(),
            },
        );

        // Drain phase
        loop {
            tokio::select! {
                joined = workers.join_next() => {
                    match joined {
                        Some(joined) => report_exit(joined, &event_tx),
                        None => break,
                    }
                }

                _ = shutdown_rx.changed(), if !stopping => {
                    stopping = true;
                }
            }
        }

        router.abort();
        tracing::info!("Shutdown");
        emit(&event_tx, ServerEvent::Stopped);

        Ok(())
    }
}

async fn bind_socket(host: &str, port: u16) -> ServerResult<UdpSocket> {
    UdpSocket::bind((host, port))
        .await
        .map_err(|e| ServerError::BindFailed(format!("Failed to bind to {}:{}: {}", host, port, e)))
}

/// Handle one first-contact datagram
#[allow(clippy::too_many_arguments)]
async fn admit(
    payload: &[u8],
    addr: SocketAddr,
    admission_socket: &UdpSocket,
    session_socket: &Arc<UdpSocket>,
    registry: &Arc<SessionRegistry>,
    config: &NetworkConfig,
    shutdown_tx: &watch::Sender<bool>,
    event_tx: &mpsc::Sender<ServerEvent>,
    workers: &mut JoinSet<WorkerExit>,
) {
    let initial = match Message::decode(payload) {
        Ok(Message::StateUpdate(state)) => state,
        Ok(_) => ParticipantState::default(),
        Err(e) => {
            tracing::debug!("Ignoring undecodable first contact from {}: {}", addr, e);
            return;
        }
    };

    let (lease, inbox) = match registry.admit(addr, initial) {
        Admission::Admitted(lease, inbox) => (lease, inbox),
        Admission::AlreadyKnown(identity) => {
            tracing::debug!("Duplicate first contact from {} (identity {})", addr, identity);
            return;
        }
        Admission::Full => {
            tracing::debug!("Server full, not admitting {}", addr);
            return;
        }
    };

    let identity = lease.identity();
    let name = lease.current().map(|state| state.name).unwrap_or_default();

    let reply = match (Message::HandshakeReply { assigned_id: identity }).encode() {
        Ok(reply) => reply,
        Err(e) => {
            tracing::error!("Could not encode handshake reply: {}", e);
            return;
        }
    };
    if let Err(e) = admission_socket.send_to(&reply, addr).await {
        // The lease drops here, so the participant is forgotten again
        tracing::warn!("Could not reply to {}: {}", addr, e);
        return;
    }

    tracing::info!(
        "Admitted {} as {} ({} of {})",
        addr,
        identity,
        registry.active_count(),
        registry.capacity()
    );
    emit(
        event_tx,
        ServerEvent::ParticipantJoined {
            identity,
            addr,
            name,
        },
    );

    let worker = SessionWorker::new(
        lease,
        inbox,
        session_socket.clone(),
        config,
        shutdown_tx.subscribe(),
    );
    workers.spawn(worker.run());
}

fn report_exit(
    joined: Result<WorkerExit, tokio::task::JoinError>,
    event_tx: &mpsc::Sender<ServerEvent>,
) {
    match joined {
        Ok(exit) => {
            tracing::info!(
                "Disconnected {} ({}) from {}: {}",
                exit.name,
                exit.identity,
                exit.addr,
                exit.reason
            );
            emit(
                event_tx,
                ServerEvent::ParticipantLeft {
                    identity: exit.identity,
                    addr: exit.addr,
                    name: exit.name,
                    reason: exit.reason,
                },
            );
        }
        Err(e) => {
            tracing::error!("Session worker failed: {}", e);
        }
    }
}

/// Forward every session datagram to the inbox of the worker owning its source
async fn route_datagrams(socket: Arc<UdpSocket>, registry: Arc<SessionRegistry>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (n, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::debug!("Session receive error: {}", e);
                tokio::task::yield_now().await;
                continue;
            }
        };

        match registry.inbox_for(&addr) {
            Some(inbox) => {
                if inbox.try_send(buf[..n].to_vec()).is_err() {
                    tracing::trace!("Inbox full or closed, dropping datagram from {}", addr);
                }
            }
            None => tracing::trace!("Datagram from unknown address {}", addr),
        }
    }
}

fn emit(event_tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    if event_tx.try_send(event).is_err() {
        tracing::trace!("Server event dropped");
    }
}
