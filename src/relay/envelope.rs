//! Relay signaling envelope — the JSON wire format for relay links

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::SwarmError;
use crate::identity::PeerId;
use crate::topic::TopicKey;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Envelope kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "data")]
    Data,
    #[serde(rename = "connection:open")]
    ConnectionOpen,
    #[serde(rename = "connection:close")]
    ConnectionClose,
    #[serde(rename = "topic:join")]
    TopicJoin,
    #[serde(rename = "topic:leave")]
    TopicLeave,
    #[serde(rename = "peer:discovery")]
    PeerDiscovery,
}

/// The signaling envelope multiplexing logical connections over a relay link.
///
/// `connection_id` addresses one logical connection; `topic` and `peer` are
/// carried by the signaling kinds that need them (hex-encoded, as the relay
/// protocol indexes everything by canonical hex).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(
        rename = "connectionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    pub timestamp: u64,
}

impl Envelope {
    pub fn data(connection_id: &str, payload: Vec<u8>) -> Self {
        Self {
            kind: EnvelopeKind::Data,
            connection_id: Some(connection_id.to_string()),
            topic: None,
            peer: None,
            data: Some(payload),
            timestamp: now_ms(),
        }
    }

    pub fn connection_open(connection_id: &str, peer: &PeerId, topic: &TopicKey) -> Self {
        Self {
            kind: EnvelopeKind::ConnectionOpen,
            connection_id: Some(connection_id.to_string()),
            topic: Some(topic.to_hex()),
            peer: Some(peer.to_hex()),
            data: None,
            timestamp: now_ms(),
        }
    }

    pub fn connection_close(connection_id: &str) -> Self {
        Self {
            kind: EnvelopeKind::ConnectionClose,
            connection_id: Some(connection_id.to_string()),
            topic: None,
            peer: None,
            data: None,
            timestamp: now_ms(),
        }
    }

    pub fn topic_join(topic: &TopicKey, peer: &PeerId) -> Self {
        Self {
            kind: EnvelopeKind::TopicJoin,
            connection_id: None,
            topic: Some(topic.to_hex()),
            peer: Some(peer.to_hex()),
            data: None,
            timestamp: now_ms(),
        }
    }

    pub fn topic_leave(topic: &TopicKey, peer: &PeerId) -> Self {
        Self {
            kind: EnvelopeKind::TopicLeave,
            connection_id: None,
            topic: Some(topic.to_hex()),
            peer: Some(peer.to_hex()),
            data: None,
            timestamp: now_ms(),
        }
    }

    pub fn peer_discovery(peer: &PeerId, topic: &TopicKey) -> Self {
        Self {
            kind: EnvelopeKind::PeerDiscovery,
            connection_id: None,
            topic: Some(topic.to_hex()),
            peer: Some(peer.to_hex()),
            data: None,
            timestamp: now_ms(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SwarmError> {
        serde_json::to_vec(self).map_err(|e| SwarmError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SwarmError> {
        serde_json::from_slice(bytes).map_err(|e| SwarmError::Serialization(e.to_string()))
    }

    /// Decode the hex topic field, when present and well-formed.
    pub fn topic_key(&self) -> Option<TopicKey> {
        self.topic.as_deref().and_then(|t| TopicKey::from_hex(t).ok())
    }

    /// Decode the hex peer field, when present and well-formed.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer.as_deref().and_then(|p| PeerId::from_hex(p).ok())
    }
}

// ============================================================================
// TESTS
// ============================================================================
