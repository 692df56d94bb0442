//! Peer table — per-topic peer records and their connection state machine

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

use crate::error::SwarmError;
use crate::identity::PeerId;
use crate::topic::TopicKey;

pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Connection state of one peer record.
///
/// Legal edges:
/// ```text
/// Discovered -> Connecting -> Connected -> Closing -> Closed
/// Connecting -> Errored
/// Connected  -> Errored
/// ```
/// `Closed` and `Errored` are terminal; a terminal record never transitions
/// again and is eligible for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Discovered,
    Connecting,
    Connected,
    Closing,
    Errored,
    Closed,
}

impl PeerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Closed | PeerState::Errored)
    }

    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(&self, next: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, next),
            (Discovered, Connecting)
                | (Connecting, Connected)
                | (Connecting, Errored)
                | (Connected, Closing)
                | (Connected, Errored)
                | (Closing, Closed)
        )
    }
}

/// How a logical connection is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    Relay,
}

/// Tracked state for one remote peer within one topic.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub topic: TopicKey,
    pub state: PeerState,
    /// Set once an attempt starts.
    pub kind: Option<TransportKind>,
    /// Set once the connection is established.
    pub connection_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub discovered_at: u64,
    pub connected_at: Option<u64>,
    pub closed_at: Option<u64>,
}

impl PeerRecord {
    fn new(peer_id: PeerId, topic: TopicKey) -> Self {
        Self {
            peer_id,
            topic,
            state: PeerState::Discovered,
            kind: None,
            connection_id: None,
            discovered_at: unix_ms(),
            connected_at: None,
            closed_at: None,
        }
    }
}

/// Tracks known peers per topic, enforcing dedup, capacity and the state
/// machine. Owned exclusively by one swarm instance.
pub struct PeerTable {
    records: HashMap<(PeerId, TopicKey), PeerRecord>,
    max_peers: usize,
}

impl PeerTable {
    pub fn new(max_peers: usize) -> Self {
        Self {
            records: HashMap::new(),
            max_peers,
        }
    }

    /// Number of active (non-terminal) records across all topics.
    pub fn active_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| !r.state.is_terminal())
            .count()
    }

    /// Fail with `PeerLimitExceeded` when admission would push the active
    /// count past the configured maximum. Callers must not start a connection
    /// attempt on this failure.
    pub fn capacity_check(&self) -> Result<(), SwarmError> {
        if self.active_count() >= self.max_peers {
            return Err(SwarmError::PeerLimitExceeded {
                limit: self.max_peers,
            });
        }
        Ok(())
    }

    /// Record a discovered peer.
    ///
    /// An existing active record for (peer, topic) is returned unchanged with
    /// `is_new = false`: repeat discovery notifications never create a second
    /// record or connection attempt. Terminal leftovers are replaced.
    pub fn upsert(
        &mut self,
        peer_id: PeerId,
        topic: TopicKey,
    ) -> Result<(&mut PeerRecord, bool), SwarmError> {
        let key = (peer_id, topic);
        let active = self
            .records
            .get(&key)
            .map(|r| !r.state.is_terminal())
            .unwrap_or(false);
        if active {
            debug!(peer = %peer_id, topic = %topic.to_hex(), "duplicate discovery ignored");
        } else {
            self.capacity_check()?;
            self.records.insert(key, PeerRecord::new(peer_id, topic));
        }
        let record = self
            .records
            .get_mut(&key)
            .ok_or_else(|| SwarmError::UnknownPeer {
                peer: peer_id.to_hex(),
            })?;
        Ok((record, !active))
    }

    /// Drive a record along a legal state-machine edge.
    ///
    /// Illegal edges fail with `InvalidTransition`; that is an internal bug
    /// and is logged loudly rather than swallowed.
    pub fn transition(
        &mut self,
        peer_id: &PeerId,
        topic: &TopicKey,
        next: PeerState,
    ) -> Result<(), SwarmError> {
        let Some(record) = self.records.get_mut(&(*peer_id, *topic)) else {
            return Err(SwarmError::UnknownPeer {
                peer: peer_id.to_hex(),
            });
        };
        if !record.state.can_transition_to(next) {
            error!(
                peer = %peer_id,
                topic = %topic.to_hex(),
                from = ?record.state,
                to = ?next,
                "illegal peer state transition"
            );
            return Err(SwarmError::InvalidTransition {
                from: record.state,
                to: next,
            });
        }
        record.state = next;
        match next {
            PeerState::Connected => record.connected_at = Some(unix_ms()),
            PeerState::Closed | PeerState::Errored => record.closed_at = Some(unix_ms()),
            _ => {}
        }
        Ok(())
    }

    pub fn get(&self, peer_id: &PeerId, topic: &TopicKey) -> Option<&PeerRecord> {
        self.records.get(&(*peer_id, *topic))
    }

    pub fn get_mut(&mut self, peer_id: &PeerId, topic: &TopicKey) -> Option<&mut PeerRecord> {
        self.records.get_mut(&(*peer_id, *topic))
    }

    pub fn remove(&mut self, peer_id: &PeerId, topic: &TopicKey) -> Option<PeerRecord> {
        self.records.remove(&(*peer_id, *topic))
    }

    /// Remove and return every record scoped to a topic. Used on leave; the
    /// caller tears down each record's connection.
    pub fn remove_by_topic(&mut self, topic: &TopicKey) -> Vec<PeerRecord> {
        let keys: Vec<_> = self
            .records
            .keys()
            .filter(|(_, t)| t == topic)
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|k| self.records.remove(&k))
            .collect()
    }

    /// Locate the record carrying a given connection id.
    pub fn find_by_connection(&self, connection_id: &str) -> Option<(PeerId, TopicKey)> {
        self.records
            .values()
            .find(|r| r.connection_id.as_deref() == Some(connection_id))
            .map(|r| (r.peer_id, r.topic))
    }

    pub fn records_for_topic(&self, topic: &TopicKey) -> Vec<PeerRecord> {
        self.records
            .values()
            .filter(|r| &r.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
