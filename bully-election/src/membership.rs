//! Group membership: who exists and where to reach them.
//!
//! [`Membership`] is the plain identity → address map that travels on the wire.
//! [`MembershipStore`] is a node's own view of it and owns the merge rules:
//! entries are never overwritten by gossip, and an identity evicted by failure
//! detection stays out until it shows up again at a different address or talks
//! to us directly.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::identity::{PeerAddress, ProcessIdentity};

/// One wire entry. Identities are structs, so the map is sent as a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberEntry {
    pub identity: ProcessIdentity,
    pub address: PeerAddress,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<MemberEntry>", into = "Vec<MemberEntry>")]
pub struct Membership {
    members: BTreeMap<ProcessIdentity, PeerAddress>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entry, returning the previous address.
    pub fn insert(&mut self, identity: ProcessIdentity, address: PeerAddress) -> Option<PeerAddress> {
        self.members.insert(identity, address)
    }

    pub fn get(&self, identity: &ProcessIdentity) -> Option<&PeerAddress> {
        self.members.get(identity)
    }

    pub fn contains(&self, identity: &ProcessIdentity) -> bool {
        self.members.contains_key(identity)
    }

    pub fn remove(&mut self, identity: &ProcessIdentity) -> Option<PeerAddress> {
        self.members.remove(identity)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&ProcessIdentity, &PeerAddress)> {
        self.members.iter()
    }

    /// Identities in ascending priority order.
    pub fn identities(&self) -> Vec<ProcessIdentity> {
        self.members.keys().copied().collect()
    }

    pub fn max_identity(&self) -> Option<ProcessIdentity> {
        self.members.keys().next_back().copied()
    }
}

impl FromIterator<(ProcessIdentity, PeerAddress)> for Membership {
    fn from_iter<I: IntoIterator<Item = (ProcessIdentity, PeerAddress)>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}

impl From<Vec<MemberEntry>> for Membership {
    fn from(entries: Vec<MemberEntry>) -> Self {
        entries
            .into_iter()
            .map(|entry| (entry.identity, entry.address))
            .collect()
    }
}

impl From<Membership> for Vec<MemberEntry> {
    fn from(membership: Membership) -> Self {
        membership
            .members
            .into_iter()
            .map(|(identity, address)| MemberEntry { identity, address })
            .collect()
    }
}

/// A node's view of the group.
#[derive(Debug, Clone)]
pub struct MembershipStore {
    local: ProcessIdentity,
    address: PeerAddress,
    members: Membership,
    /// Evicted identities and the address they were evicted at.
    suspected: HashMap<ProcessIdentity, PeerAddress>,
}

impl MembershipStore {
    /// Creates the store from the directory snapshot. The local entry is
    /// always present, whatever the snapshot says about it.
    pub fn new(local: ProcessIdentity, address: PeerAddress, snapshot: &Membership) -> Self {
        let mut members = Membership::new();
        members.insert(local, address.clone());
        let mut store = Self {
            local,
            address,
            members,
            suspected: HashMap::new(),
        };
        store.merge(snapshot);
        store
    }

    pub fn members(&self) -> &Membership {
        &self.members
    }

    /// Copy of the current view, as carried on ELECTION/OK/COORDINATOR.
    pub fn snapshot(&self) -> Membership {
        self.members.clone()
    }

    pub fn address_of(&self, identity: &ProcessIdentity) -> Option<&PeerAddress> {
        self.members.get(identity)
    }

    pub fn contains(&self, identity: &ProcessIdentity) -> bool {
        self.members.contains(identity)
    }

    pub fn max_identity(&self) -> Option<ProcessIdentity> {
        self.members.max_identity()
    }

    /// Unions `incoming` into the view and returns how many entries were added.
    ///
    /// Known identities keep their address. Suspected identities are only
    /// re-admitted when they come back at a new address.
    pub fn merge(&mut self, incoming: &Membership) -> usize {
        let mut added = 0;
        for (identity, address) in incoming.iter() {
            if *identity == self.local {
                if *address != self.address {
                    warn!(%identity, %address, "another process claims our identity");
                }
                continue;
            }
            if let Some(existing) = self.members.get(identity) {
                if existing != address {
                    warn!(%identity, %existing, %address, "identity collision, keeping known address");
                }
                continue;
            }
            if let Some(evicted_at) = self.suspected.get(identity) {
                if evicted_at == address {
                    continue;
                }
                debug!(%identity, %address, "suspected process rejoined at a new address");
                self.suspected.remove(identity);
            }
            self.members.insert(*identity, address.clone());
            added += 1;
        }
        added
    }

    /// Members with a strictly higher identity than ours, lowest first.
    pub fn higher_than_local(&self) -> Vec<(ProcessIdentity, PeerAddress)> {
        self.members
            .iter()
            .filter(|(identity, _)| **identity > self.local)
            .map(|(identity, address)| (*identity, address.clone()))
            .collect()
    }

    /// Members with a strictly lower identity than ours, highest first.
    pub fn lower_than_local(&self) -> Vec<(ProcessIdentity, PeerAddress)> {
        self.members
            .iter()
            .rev()
            .filter(|(identity, _)| **identity < self.local)
            .map(|(identity, address)| (*identity, address.clone()))
            .collect()
    }

    /// Removes a process that failed to answer and remembers it as suspected.
    /// The local entry can't be evicted.
    pub fn evict(&mut self, identity: &ProcessIdentity) -> Option<PeerAddress> {
        if *identity == self.local {
            return None;
        }
        let address = self.members.remove(identity)?;
        self.suspected.insert(*identity, address.clone());
        Some(address)
    }

    pub fn is_suspected(&self, identity: &ProcessIdentity) -> bool {
        self.suspected.contains_key(identity)
    }

    /// Clears suspicion for a process that just talked to us. Returns whether
    /// it was suspected.
    pub fn vindicate(&mut self, identity: &ProcessIdentity) -> bool {
        self.suspected.remove(identity).is_some()
    }
}
