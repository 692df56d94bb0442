//! Typed application-facing lifecycle events
//!
//! Events are fanned out over a broadcast channel with enumerated kinds and
//! typed payloads; connections are routed by explicit connection-id lookup,
//! never by dynamic event names.

use crate::identity::PeerId;
use crate::peer::TransportKind;
use crate::topic::TopicKey;

/// Metadata describing an established logical connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub peer_id: PeerId,
    pub topic: TopicKey,
    pub kind: TransportKind,
    /// Milliseconds since the Unix epoch.
    pub connected_at: u64,
}

/// Lifecycle events observable by the application.
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    /// A new peer was admitted to the peer table for a topic.
    PeerDiscovered { peer_id: PeerId, topic: TopicKey },
    /// A logical connection reached the connected state.
    Connection(ConnectionInfo),
    /// A logical connection closed. Emitted exactly once per connection.
    Disconnection {
        peer_id: PeerId,
        topic: TopicKey,
        /// Milliseconds since the Unix epoch.
        closed_at: u64,
    },
    /// An isolated failure: one peer's error never aborts work on others.
    Error {
        peer_id: Option<PeerId>,
        topic: Option<TopicKey>,
        reason: String,
    },
    /// A relay link came up.
    RelayConnected { url: String },
    /// A relay link went down.
    RelayDisconnected { url: String },
    /// A relay link failed.
    RelayError { url: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;
    use crate::topic::{Topic, TopicKey};

    #[test]
    fn test_events_are_cloneable_for_broadcast() {
        let topic = TopicKey::normalize(&Topic::from("events")).unwrap();
        let event = SwarmEvent::PeerDiscovered {
            peer_id: KeyPair::generate().peer_id(),
            topic,
        };
        let copy = event.clone();
        match (event, copy) {
            (
                SwarmEvent::PeerDiscovered { topic: a, .. },
                SwarmEvent::PeerDiscovered { topic: b, .. },
            ) => assert_eq!(a, b),
            _ => panic!("clone changed the event kind"),
        }
    }
}
