//! The Bully Algorithm.
//!
//! [`Coordinator`] is a sans-IO state machine. The caller feeds it events
//! (`on_accept`, `on_writable`, `on_message`, `on_failure`, `on_tick`) together
//! with the current time, then collects the resulting [`Action`]s with
//! [`Coordinator::drain_actions`] and carries them out. The multiplexer does
//! that over TCP; the tests below do it in memory.
//!
//! # Protocol
//!
//! - **Start an election**: send ELECTION to every strictly higher member. With
//!   nobody higher, or once all of them failed to answer, declare victory.
//! - **ELECTION received**: answer OK and, unless already electing, start our
//!   own election. Cascades are expected.
//! - **OK received**: a higher process is alive; stand down and wait for its
//!   COORDINATOR.
//! - **Declare victory**: become leader and send COORDINATOR to every strictly
//!   lower member.
//! - **COORDINATOR received**: adopt the sender as leader. A lower sender is
//!   bullied with a fresh election instead.
//! - **Probe**: followers periodically PROBE the leader. No OK in time means the
//!   leader is evicted and a new election starts.
//!
//! Because every node applies the same strict ordering, only the highest live
//! process ever finds nobody above it, so at most one node declares victory
//! for a given membership.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::ElectionConfig;
use crate::error::PeerError;
use crate::identity::{PeerAddress, ProcessIdentity};
use crate::membership::{Membership, MembershipStore};
use crate::message::Message;
use crate::state::{ConnId, PeerState, Purpose, StateTable};

/// Work for the I/O layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Dial `address` and register the resulting connection as `conn`.
    Connect { conn: ConnId, address: PeerAddress },
    /// Call [`Coordinator::on_writable`] once `conn` can be written.
    WantWrite(ConnId),
    Send { conn: ConnId, message: Message },
    /// Flush anything queued on `conn`, then close it.
    Close(ConnId),
}

pub struct Coordinator {
    identity: ProcessIdentity,
    config: ElectionConfig,
    members: MembershipStore,
    table: StateTable,
    leader: Option<ProcessIdentity>,
    last_probe: Option<Instant>,
    outbox: Vec<Action>,
}

impl Coordinator {
    /// Creates a coordinator for `identity` listening at `address`, seeded with
    /// the directory's membership snapshot. No election is started yet.
    pub fn new(
        identity: ProcessIdentity,
        address: PeerAddress,
        snapshot: &Membership,
        config: ElectionConfig,
        now: Instant,
    ) -> Self {
        Self {
            identity,
            config,
            members: MembershipStore::new(identity, address, snapshot),
            table: StateTable::new(now),
            leader: None,
            last_probe: None,
            outbox: Vec::new(),
        }
    }

    pub fn identity(&self) -> ProcessIdentity {
        self.identity
    }

    pub fn leader(&self) -> Option<ProcessIdentity> {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.leader == Some(self.identity)
    }

    /// The local election phase.
    pub fn phase(&self) -> PeerState {
        self.table.local()
    }

    pub fn members(&self) -> &Membership {
        self.members.members()
    }

    pub fn open_connections(&self) -> usize {
        self.table.len()
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    /// Takes every action queued since the last call, in order.
    pub fn drain_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.outbox)
    }

    pub fn start_election(&mut self, now: Instant) {
        self.table.set_local(PeerState::WaitingForOk, now);
        let contenders = self.members.higher_than_local();
        if contenders.is_empty() {
            self.declare_victory(now);
            return;
        }
        info!(
            identity = %self.identity,
            contenders = contenders.len(),
            "starting election"
        );
        for (target, address) in contenders {
            self.open(Purpose::Election, target, address, PeerState::SendElection, now);
        }
    }

    /// Registers a connection the listener accepted.
    pub fn on_accept(&mut self, now: Instant) -> ConnId {
        self.table.accept(now)
    }

    /// Sends the one message pending for `conn` and advances its state.
    pub fn on_writable(&mut self, conn: ConnId, now: Instant) {
        let Some(entry) = self.table.get(conn).copied() else {
            return;
        };
        let from = self.identity;
        let message = match entry.state {
            PeerState::SendElection => Message::Election {
                from,
                members: self.members.snapshot(),
            },
            PeerState::SendVictory => Message::Coordinator {
                from,
                members: self.members.snapshot(),
            },
            PeerState::SendOk => Message::Ok {
                from,
                members: self.members.snapshot(),
            },
            PeerState::SendProbe => Message::Probe { from },
            _ => return,
        };
        debug!(conn, kind = message.kind(), target = ?entry.target, "sending");
        self.outbox.push(Action::Send { conn, message });

        match entry.state {
            PeerState::SendElection | PeerState::SendProbe => {
                self.table.set(conn, PeerState::WaitingForOk, now);
            }
            _ => self.finish(conn),
        }
    }

    pub fn on_message(&mut self, conn: ConnId, message: Message, now: Instant) {
        let Some(entry) = self.table.get(conn).copied() else {
            debug!(conn, kind = message.kind(), "message on closed connection dropped");
            return;
        };
        let kind = message.kind();

        match message {
            Message::Election { from, members } => {
                self.hear_from(from, &members);
                if !self.expecting_request(conn, entry.state, kind, now) {
                    return;
                }
                self.reply_ok(conn, now);
                if self.table.election_in_progress() {
                    debug!(%from, "already electing, answered OK");
                } else {
                    info!(%from, "received ELECTION");
                    self.start_election(now);
                }
            }
            Message::Ok { from, members } => {
                self.hear_from(from, &members);
                self.finish(conn);
                if entry.state != PeerState::WaitingForOk {
                    debug!(conn, %from, state = ?entry.state, "unsolicited OK ignored");
                    return;
                }
                match entry.purpose {
                    Purpose::Election => self.stand_down(from, now),
                    Purpose::Probe => debug!(leader = %from, "leader answered probe"),
                    Purpose::Inbound | Purpose::Victory => {}
                }
            }
            Message::Coordinator { from, members } => {
                self.hear_from(from, &members);
                if !self.expecting_request(conn, entry.state, kind, now) {
                    return;
                }
                self.finish(conn);
                self.adopt_leader(from, now);
            }
            Message::Probe { from } => {
                self.hear_from(from, &Membership::new());
                if !self.expecting_request(conn, entry.state, kind, now) {
                    return;
                }
                self.reply_ok(conn, now);
            }
            Message::Join { identity, .. } => {
                warn!(%identity, "JOIN sent to a peer instead of the directory");
                self.on_failure(conn, &PeerError::Unexpected(kind), now);
            }
        }
    }

    /// Single failure path for connect errors, resets, malformed frames and
    /// timeouts. A peer that owed us an answer is evicted.
    pub fn on_failure(&mut self, conn: ConnId, error: &PeerError, now: Instant) {
        let Some(entry) = self.table.remove(conn) else {
            return;
        };
        self.outbox.push(Action::Close(conn));

        let suspect = entry.target.filter(|_| entry.state.awaits_reply());
        let Some(target) = suspect else {
            debug!(conn, purpose = ?entry.purpose, %error, "connection closed");
            return;
        };

        warn!(%target, purpose = ?entry.purpose, %error, "peer did not answer, evicting");
        self.members.evict(&target);
        match entry.purpose {
            Purpose::Election => self.finish_unanswered_election(now),
            Purpose::Probe => self.leader_failed(target, now),
            Purpose::Inbound | Purpose::Victory => {}
        }
    }

    /// Periodic housekeeping: failure timeouts, the stand-down deadline and
    /// leader probing.
    pub fn on_tick(&mut self, now: Instant) {
        let timeout = self.config.failure_timeout;
        for conn in self.table.expired(now, timeout) {
            self.on_failure(conn, &PeerError::TimedOut(timeout), now);
        }

        if self.table.local() == PeerState::WaitingForVictor
            && now.saturating_duration_since(self.table.local_since()) >= self.config.victor_timeout
        {
            warn!("winner never announced itself, restarting election");
            self.start_election(now);
        }

        self.maybe_probe(now);
    }

    fn declare_victory(&mut self, now: Instant) {
        let followers = self.members.lower_than_local();
        info!(
            identity = %self.identity,
            followers = followers.len(),
            "declared victory"
        );
        self.leader = Some(self.identity);
        self.table.set_local(PeerState::Quiescent, now);
        for (target, address) in followers {
            self.open(Purpose::Victory, target, address, PeerState::SendVictory, now);
        }
    }

    fn open(
        &mut self,
        purpose: Purpose,
        target: ProcessIdentity,
        address: PeerAddress,
        state: PeerState,
        now: Instant,
    ) -> ConnId {
        let conn = self.table.open(purpose, target, state, now);
        self.outbox.push(Action::Connect { conn, address });
        self.outbox.push(Action::WantWrite(conn));
        conn
    }

    fn finish(&mut self, conn: ConnId) {
        if self.table.remove(conn).is_some() {
            self.outbox.push(Action::Close(conn));
        }
    }

    fn reply_ok(&mut self, conn: ConnId, now: Instant) {
        self.table.set(conn, PeerState::SendOk, now);
        self.outbox.push(Action::WantWrite(conn));
    }

    fn hear_from(&mut self, from: ProcessIdentity, members: &Membership) {
        if self.members.vindicate(&from) {
            debug!(%from, "suspected process is alive after all");
        }
        self.members.merge(members);
    }

    /// ELECTION, COORDINATOR and PROBE only open a conversation; they are
    /// never valid as a reply.
    fn expecting_request(
        &mut self,
        conn: ConnId,
        state: PeerState,
        kind: &'static str,
        now: Instant,
    ) -> bool {
        if state == PeerState::WaitingForAnyMessage {
            return true;
        }
        warn!(conn, kind, ?state, "request arrived where a reply was expected");
        self.on_failure(conn, &PeerError::Unexpected(kind), now);
        false
    }

    fn stand_down(&mut self, from: ProcessIdentity, now: Instant) {
        if self.table.election_in_progress() {
            info!(%from, "higher process answered, waiting for its victory");
            self.table.set_local(PeerState::WaitingForVictor, now);
        }
    }

    fn finish_unanswered_election(&mut self, now: Instant) {
        if self.table.election_in_progress() && self.table.outstanding(Purpose::Election) == 0 {
            info!("no higher process answered");
            self.declare_victory(now);
        }
    }

    fn adopt_leader(&mut self, from: ProcessIdentity, now: Instant) {
        if from < self.identity {
            if self.table.election_in_progress() {
                debug!(announcer = %from, "lower announcement during our election ignored");
            } else {
                info!(announcer = %from, "lower process announced itself, taking over");
                self.start_election(now);
            }
            return;
        }

        if self.leader != Some(from) {
            info!(leader = %from, "new leader");
        }
        self.leader = Some(from);
        self.table.set_local(PeerState::Quiescent, now);
        self.last_probe = Some(now);
    }

    fn leader_failed(&mut self, target: ProcessIdentity, now: Instant) {
        if self.leader != Some(target) {
            return;
        }
        warn!(leader = %target, "leader failed its probe");
        self.leader = None;
        if !self.table.election_in_progress() {
            self.start_election(now);
        }
    }

    fn maybe_probe(&mut self, now: Instant) {
        let Some(leader) = self.leader else {
            return;
        };
        if leader == self.identity
            || self.table.local() != PeerState::Quiescent
            || self.table.outstanding(Purpose::Probe) > 0
        {
            return;
        }
        if let Some(at) = self.last_probe {
            if now.saturating_duration_since(at) < self.config.probe_interval {
                return;
            }
        }
        self.last_probe = Some(now);

        match self.members.address_of(&leader).cloned() {
            Some(address) => {
                debug!(%leader, "probing leader");
                self.open(Purpose::Probe, leader, address, PeerState::SendProbe, now);
            }
            None => {
                warn!(%leader, "leader has no known address");
                self.leader_failed(leader, now);
            }
        }
    }
}
