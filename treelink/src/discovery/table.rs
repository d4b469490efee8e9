//! Raw and cooked discovery results.
//!
//! Raw entries are keyed by (local interface, source address, peer id), so a
//! peer reachable over two interfaces has two raw entries. Cooking groups raw
//! entries by system name, then by peer id, and the reported change set is
//! the deep diff between consecutive cooked tables.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use minstant::Instant;

use crate::message::Message;
use crate::net::Endpoint;

use super::protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawKey {
    pub interface: Ipv4Addr,
    pub source: Endpoint,
    pub peer_id: u64,
}

#[derive(Debug, Clone)]
struct RawEntry {
    payload: Message,
    expires: Instant,
    /// Bumped on insert and on payload change only, so refreshes never
    /// reorder "last write wins".
    seq: u64,
}

/// One peer of a system as last seen.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub peer_id: u64,
    /// Address the reply came from.
    pub source: Endpoint,
    /// Local interface the reply arrived on.
    pub interface: Ipv4Addr,
    pub payload: Message,
}

impl PeerInfo {
    /// Address of the peer's TCP service, if it advertises one.
    #[must_use]
    pub fn tcp_endpoint(&self) -> Option<Endpoint> {
        self.payload
            .get_port(protocol::field::TCP_PORT)
            .map(|port| self.source.with_port(port))
    }

    /// Address answering time-sync pings, if advertised.
    #[must_use]
    pub fn time_sync_endpoint(&self) -> Option<Endpoint> {
        self.payload
            .get_port(protocol::field::TIME_SYNC_PORT)
            .map(|port| self.source.with_port(port))
    }
}

/// Everything currently known about one system.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemInfo {
    pub name: String,
    pub peers: BTreeMap<u64, PeerInfo>,
}

impl SystemInfo {
    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.values()
    }
}

/// One reported difference. `info == None` means the system disappeared.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryChange {
    pub system: String,
    pub info: Option<SystemInfo>,
}

#[derive(Debug, Default)]
pub struct ResultTable {
    raw: HashMap<RawKey, RawEntry>,
    reported: BTreeMap<String, SystemInfo>,
    next_seq: u64,
    dirty: bool,
}

impl ResultTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a raw entry. Returns `true` if the payload is new
    /// or differs from the stored one; a pure expiry refresh returns `false`.
    pub fn upsert(&mut self, key: RawKey, payload: Message, expires: Instant) -> bool {
        if let Some(entry) = self.raw.get_mut(&key) {
            entry.expires = expires;
            if entry.payload == payload {
                return false;
            }
            entry.payload = payload;
            entry.seq = self.next_seq;
        } else {
            self.raw.insert(
                key,
                RawEntry {
                    payload,
                    expires,
                    seq: self.next_seq,
                },
            );
        }
        self.next_seq += 1;
        self.dirty = true;
        true
    }

    /// Removes entries whose expiry has passed. Returns how many went.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.raw.len();
        self.raw.retain(|_, e| e.expires > now);
        let removed = before - self.raw.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Drops entries learned through interfaces that no longer exist.
    pub fn retain_interfaces(&mut self, interfaces: &[Ipv4Addr]) -> usize {
        let before = self.raw.len();
        self.raw.retain(|k, _| interfaces.contains(&k.interface));
        let removed = before - self.raw.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Forgets everything; the next [`take_changes`](Self::take_changes)
    /// reports every known system as removed.
    pub fn clear(&mut self) {
        if !self.raw.is_empty() {
            self.raw.clear();
            self.dirty = true;
        }
    }

    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }

    /// The cooked table as last reported.
    #[must_use]
    pub const fn reported(&self) -> &BTreeMap<String, SystemInfo> {
        &self.reported
    }

    /// Recomputes the cooked table if anything changed and returns the diff
    /// against the previous one, which becomes the new baseline.
    pub fn take_changes(&mut self) -> Vec<DiscoveryChange> {
        if !std::mem::take(&mut self.dirty) {
            return Vec::new();
        }
        let cooked = self.cook();
        let mut changes = Vec::new();
        for name in self.reported.keys() {
            if !cooked.contains_key(name) {
                changes.push(DiscoveryChange {
                    system: name.clone(),
                    info: None,
                });
            }
        }
        for (name, info) in &cooked {
            if self.reported.get(name) != Some(info) {
                changes.push(DiscoveryChange {
                    system: name.clone(),
                    info: Some(info.clone()),
                });
            }
        }
        self.reported = cooked;
        changes
    }

    fn cook(&self) -> BTreeMap<String, SystemInfo> {
        let mut entries: Vec<(&RawKey, &RawEntry)> = self.raw.iter().collect();
        entries.sort_by_key(|(_, e)| e.seq);

        let mut cooked: BTreeMap<String, SystemInfo> = BTreeMap::new();
        for (key, entry) in entries {
            let Some(name) = protocol::system_name(&entry.payload) else {
                continue;
            };
            let system = cooked
                .entry(name.to_owned())
                .or_insert_with(|| SystemInfo {
                    name: name.to_owned(),
                    peers: BTreeMap::new(),
                });
            system.peers.insert(
                key.peer_id,
                PeerInfo {
                    peer_id: key.peer_id,
                    source: key.source,
                    interface: key.interface,
                    payload: entry.payload.clone(),
                },
            );
        }
        cooked
    }
}
