//! Session registry
//!
//! Shared map of every admitted participant. The admission listener creates
//! entries; after that each entry is written only through the [`SessionLease`]
//! handed to its worker, and dropping the lease removes the entry.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;

use crate::protocol::{encode_record, CodecError, Identity, ParticipantState, Roster};

/// Datagrams queued per worker before the router starts dropping
const INBOX_CAPACITY: usize = 64;

/// Server-side record of one participant
#[derive(Debug)]
struct SessionRecord {
    addr: SocketAddr,
    state: ParticipantState,
    inbox: mpsc::Sender<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Sessions {
    by_identity: BTreeMap<Identity, SessionRecord>,
    by_addr: HashMap<SocketAddr, Identity>,
}

impl Sessions {
    /// Check the roster still fits one datagram with `candidate` as `identity`'s state
    fn fits_with(&self, identity: Identity, candidate: &ParticipantState) -> Result<(), CodecError> {
        let mut roster: BTreeMap<Identity, &ParticipantState> = self
            .by_identity
            .iter()
            .map(|(&id, record)| (id, &record.state))
            .collect();
        roster.insert(identity, candidate);

        encode_record(&roster).map(|_| ())
    }
}

/// Outcome of an admission attempt
#[derive(Debug)]
pub enum Admission {
    /// New session created, with the receiving end of its inbox
    Admitted(SessionLease, mpsc::Receiver<Vec<u8>>),
    /// The address already has a live session
    AlreadyKnown(Identity),
    /// Capacity reached
    Full,
}

/// Registry of active sessions
#[derive(Debug)]
pub struct SessionRegistry {
    capacity: usize,
    next_identity: AtomicU32,
    sessions: RwLock<Sessions>,
}

impl SessionRegistry {
    /// Create a registry admitting at most `capacity` concurrent participants
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            next_identity: AtomicU32::new(0),
            sessions: RwLock::new(Sessions::default()),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Sessions> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Sessions> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to admit a participant first seen at `addr`
    ///
    /// Identities come from a process-wide counter and are never handed out twice,
    /// even after the session that held one has ended.
    pub fn admit(self: &Arc<Self>, addr: SocketAddr, initial: ParticipantState) -> Admission {
        let mut sessions = self.write();

        if let Some(&identity) = sessions.by_addr.get(&addr) {
            return Admission::AlreadyKnown(identity);
        }
        if sessions.by_identity.len() >= self.capacity {
            return Admission::Full;
        }

        let identity = self.next_identity.fetch_add(1, Ordering::SeqCst);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

        let mut initial = initial.with_id(identity);
        if let Err(e) = sessions.fits_with(identity, &initial) {
            tracing::warn!(identity, %addr, "Initial state dropped: {}", e);
            initial = ParticipantState::default().with_id(identity);
        }

        sessions.by_addr.insert(addr, identity);
        sessions.by_identity.insert(
            identity,
            SessionRecord {
                addr,
                state: initial,
                inbox: inbox_tx,
            },
        );

        let lease = SessionLease {
            identity,
            addr,
            registry: Arc::clone(self),
        };
        Admission::Admitted(lease, inbox_rx)
    }

    /// Consistent copy of every participant's latest state
    pub fn snapshot(&self) -> Roster {
        self.read()
            .by_identity
            .iter()
            .map(|(&identity, record)| (identity, record.state.clone()))
            .collect()
    }

    /// Last known state of one participant
    pub fn state_of(&self, identity: Identity) -> Option<ParticipantState> {
        self.read()
            .by_identity
            .get(&identity)
            .map(|record| record.state.clone())
    }

    /// Inbox of the session owning `addr`, if any
    pub fn inbox_for(&self, addr: &SocketAddr) -> Option<mpsc::Sender<Vec<u8>>> {
        let sessions = self.read();
        let identity = sessions.by_addr.get(addr)?;
        sessions.by_identity.get(identity).map(|record| record.inbox.clone())
    }

    /// Identity of the session owning `addr`, if any
    pub fn identity_of(&self, addr: &SocketAddr) -> Option<Identity> {
        self.read().by_addr.get(addr).copied()
    }

    /// Number of live sessions
    pub fn active_count(&self) -> usize {
        self.read().by_identity.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.active_count() >= self.capacity
    }

    fn update(&self, identity: Identity, state: ParticipantState) -> Result<(), CodecError> {
        let state = state.with_id(identity);
        let mut sessions = self.write();
        sessions.fits_with(identity, &state)?;

        if let Some(record) = sessions.by_identity.get_mut(&identity) {
            record.state = state;
        }
        Ok(())
    }

    fn remove(&self, identity: Identity) {
        let mut sessions = self.write();
        if let Some(record) = sessions.by_identity.remove(&identity) {
            sessions.by_addr.remove(&record.addr);
        }
    }
}

/// Exclusive write handle to one registry entry
///
/// Held by the session worker; dropping it tears the entry down.
#[derive(Debug)]
pub struct SessionLease {
    identity: Identity,
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
}

impl SessionLease {
    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Overwrite this participant's last known state
    ///
    /// Refused, leaving the previous state in place, when the roster would no
    /// longer fit in one datagram.
    pub fn update(&self, state: ParticipantState) -> Result<(), CodecError> {
        self.registry.update(self.identity, state)
    }

    /// This participant's last known state
    pub fn current(&self) -> Option<ParticipantState> {
        self.registry.state_of(self.identity)
    }

    /// Current roster, including this participant
    pub fn roster(&self) -> Roster {
        self.registry.snapshot()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.remove(self.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Rect;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn state(name: &str) -> ParticipantState {
        ParticipantState::new(name, Rect::new(0, 0, 10, 10), 1, false)
    }

    fn admitted(admission: Admission) -> SessionLease {
        match admission {
            Admission::Admitted(lease, _) => lease,
            other => panic!("expected admission, got {other:?}"),
        }
    }

    #[test]
    fn test_identities_increase_from_zero() {
        let registry = SessionRegistry::new(3);
        let ids: Vec<_> = (0..3)
            .map(|i| admitted(registry.admit(addr(5000 + i), state("p"))))
            .collect();

        assert_eq!(
            ids.iter().map(SessionLease::identity).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(registry.active_count(), 3);
        assert!(registry.is_full());
    }

    #[test]
    fn test_capacity_refuses_without_error() {
        let registry = SessionRegistry::new(1);
        let _lease = admitted(registry.admit(addr(5000), state("a")));

        assert!(matches!(registry.admit(addr(5001), state("b")), Admission::Full));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_duplicate_address_is_idempotent() {
        let registry = SessionRegistry::new(3);
        let lease = admitted(registry.admit(addr(5000), state("a")));

        match registry.admit(addr(5000), state("a")) {
            Admission::AlreadyKnown(identity) => assert_eq!(identity, lease.identity()),
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_identities_not_reused_after_departure() {
        let registry = SessionRegistry::new(1);
        let first = admitted(registry.admit(addr(5000), state("a")));
        assert_eq!(first.identity(), 0);
        drop(first);

        let second = admitted(registry.admit(addr(5000), state("a")));
        assert_eq!(second.identity(), 1);
    }

    #[test]
    fn test_dropping_lease_removes_entry() {
        let registry = SessionRegistry::new(2);
        let a = admitted(registry.admit(addr(5000), state("a")));
        let _b = admitted(registry.admit(addr(5001), state("b")));

        drop(a);

        let roster = registry.snapshot();
        assert_eq!(roster.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert!(registry.inbox_for(&addr(5000)).is_none());
        assert_eq!(registry.identity_of(&addr(5001)), Some(1));
    }

    #[test]
    fn test_update_stamps_owner_identity() {
        let registry = SessionRegistry::new(2);
        let _a = admitted(registry.admit(addr(5000), state("a")));
        let b = admitted(registry.admit(addr(5001), state("b")));

        // a client claiming someone else's ID only ever writes its own entry
        b.update(state("b2").with_id(0)).unwrap();

        let roster = b.roster();
        assert_eq!(roster[&0].name, "a");
        assert_eq!(roster[&1].name, "b2");
        assert_eq!(roster[&1].id, Some(1));
    }

    #[test]
    fn test_update_that_overflows_roster_is_refused() {
        let registry = SessionRegistry::new(2);
        let a = admitted(registry.admit(addr(5000), state("a")));
        let b = admitted(registry.admit(addr(5001), state("b")));
        let long_name = "x".repeat(1100);

        // each fits on its own, both together do not
        a.update(state(&long_name)).unwrap();
        let refused = b.update(state(&long_name));

        assert!(matches!(refused, Err(CodecError::TooLarge(..))));
        assert_eq!(registry.state_of(1).unwrap().name, "b");
        assert!(crate::protocol::Message::Roster(registry.snapshot()).encode().is_ok());
    }

    #[test]
    fn test_oversized_initial_state_gets_placeholder() {
        let registry = SessionRegistry::new(2);
        let a = admitted(registry.admit(addr(5000), state("a")));
        a.update(state(&"x".repeat(1100))).unwrap();

        let b = admitted(registry.admit(addr(5001), state(&"y".repeat(1100))));

        let current = b.current().unwrap();
        assert_eq!(current.name, "");
        assert_eq!(current.id, Some(1));
    }

    #[tokio::test]
    async fn test_inbox_routes_to_owner() {
        let registry = SessionRegistry::new(1);
        let Admission::Admitted(_lease, mut inbox) = registry.admit(addr(5000), state("a")) else {
            panic!("expected admission");
        };

        registry
            .inbox_for(&addr(5000))
            .unwrap()
            .try_send(b"{}".to_vec())
            .unwrap();

        assert_eq!(inbox.recv().await.unwrap(), b"{}".to_vec());
        assert!(registry.inbox_for(&addr(5001)).is_none());
    }
}
