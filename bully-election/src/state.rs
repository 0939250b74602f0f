//! Per-connection protocol state.
//!
//! Every open connection gets one [`PeerEntry`] keyed by a [`ConnId`] handed out
//! here. The table never owns a socket; the multiplexer does. One extra slot
//! tracks the node's own election phase.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::identity::ProcessIdentity;

/// Stable handle for one connection. Never reused within a node's lifetime.
pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Nothing pending.
    Quiescent,

    // An outgoing message is pending until the connection is writable.
    SendElection,
    SendVictory,
    SendOk,
    SendProbe,

    // An incoming message is pending.
    /// ELECTION or PROBE sent; waiting for OK. For the local slot: election
    /// in progress.
    WaitingForOk,
    /// Local slot only: a higher process answered OK, waiting for its
    /// COORDINATOR.
    WaitingForVictor,
    /// Accepted connection, nothing received yet.
    WaitingForAnyMessage,
}

impl PeerState {
    /// States in which the remote side owes us an answer. Failing here makes
    /// the remote a suspect.
    pub fn awaits_reply(self) -> bool {
        matches!(
            self,
            PeerState::SendElection | PeerState::SendProbe | PeerState::WaitingForOk
        )
    }
}

/// Why a connection was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Inbound,
    Election,
    Victory,
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEntry {
    pub state: PeerState,
    pub purpose: Purpose,
    /// Process on the other end, for connections we opened.
    pub target: Option<ProcessIdentity>,
    /// When `state` was entered.
    pub since: Instant,
}

#[derive(Debug)]
pub struct StateTable {
    local: PeerState,
    local_since: Instant,
    peers: HashMap<ConnId, PeerEntry>,
    next_conn: ConnId,
}

impl StateTable {
    pub fn new(now: Instant) -> Self {
        Self {
            local: PeerState::Quiescent,
            local_since: now,
            peers: HashMap::new(),
            next_conn: 1,
        }
    }

    pub fn local(&self) -> PeerState {
        self.local
    }

    pub fn local_since(&self) -> Instant {
        self.local_since
    }

    pub fn set_local(&mut self, state: PeerState, now: Instant) {
        self.local = state;
        self.local_since = now;
    }

    pub fn election_in_progress(&self) -> bool {
        self.local == PeerState::WaitingForOk
    }

    /// Registers a connection we are about to dial.
    pub fn open(
        &mut self,
        purpose: Purpose,
        target: ProcessIdentity,
        state: PeerState,
        now: Instant,
    ) -> ConnId {
        self.insert(PeerEntry {
            state,
            purpose,
            target: Some(target),
            since: now,
        })
    }

    /// Registers a connection the listener just accepted.
    pub fn accept(&mut self, now: Instant) -> ConnId {
        self.insert(PeerEntry {
            state: PeerState::WaitingForAnyMessage,
            purpose: Purpose::Inbound,
            target: None,
            since: now,
        })
    }

    fn insert(&mut self, entry: PeerEntry) -> ConnId {
        let conn = self.next_conn;
        self.next_conn += 1;
        self.peers.insert(conn, entry);
        conn
    }

    pub fn get(&self, conn: ConnId) -> Option<&PeerEntry> {
        self.peers.get(&conn)
    }

    /// Moves a connection to `state`. Returns false for unknown handles.
    pub fn set(&mut self, conn: ConnId, state: PeerState, now: Instant) -> bool {
        match self.peers.get_mut(&conn) {
            Some(entry) => {
                entry.state = state;
                entry.since = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, conn: ConnId) -> Option<PeerEntry> {
        self.peers.remove(&conn)
    }

    /// Connections opened for `purpose` that are still in flight.
    pub fn outstanding(&self, purpose: Purpose) -> usize {
        self.peers
            .values()
            .filter(|entry| entry.purpose == purpose)
            .count()
    }

    /// Connections that have sat in their current state for at least
    /// `timeout`, oldest first.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<ConnId> {
        let mut expired: Vec<(Instant, ConnId)> = self
            .peers
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.since) >= timeout)
            .map(|(conn, entry)| (entry.since, *conn))
            .collect();
        expired.sort_unstable();
        expired.into_iter().map(|(_, conn)| conn).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}
