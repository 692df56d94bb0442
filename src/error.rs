//! Error taxonomy for swarm lifecycle operations

use crate::peer::PeerState;
use thiserror::Error;

/// Errors surfaced by swarm, registry, peer table and relay operations.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// The topic input was empty or the wrong length. Caller must fix its input.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Admission would push the active peer count past the configured maximum.
    #[error("peer limit of {limit} exceeded")]
    PeerLimitExceeded { limit: usize },

    /// The connecting phase did not complete within the configured window.
    #[error("connection attempt timed out after {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },

    /// A connection attempt for this (peer, topic) pair is already in flight.
    #[error("connection attempt already in progress for peer {peer}")]
    AttemptInProgress { peer: String },

    /// A live connection to this peer already exists; reuse it instead.
    #[error("already connected to peer {peer}")]
    AlreadyConnected { peer: String },

    /// Both the direct path and the relay fallback failed.
    #[error("connection failed (direct: {direct}; relay: {relay})")]
    ConnectionFailed {
        direct: Box<SwarmError>,
        relay: Box<SwarmError>,
    },

    /// Operation attempted after `destroy()`.
    #[error("swarm has been destroyed")]
    Destroyed,

    /// Illegal edge in the peer state machine. Indicates a bug, never swallowed.
    #[error("invalid peer state transition {from:?} -> {to:?}")]
    InvalidTransition { from: PeerState, to: PeerState },

    /// Transition or teardown referenced a peer record that does not exist.
    #[error("unknown peer record for {peer}")]
    UnknownPeer { peer: String },

    #[error("dht error: {0}")]
    Dht(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_failed_carries_both_causes() {
        let err = SwarmError::ConnectionFailed {
            direct: Box::new(SwarmError::ConnectionTimeout { timeout_ms: 30000 }),
            relay: Box::new(SwarmError::Relay("no reachable relay".to_string())),
        };
        let text = err.to_string();
        assert!(text.contains("timed out after 30000ms"));
        assert!(text.contains("no reachable relay"));
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = SwarmError::InvalidTransition {
            from: PeerState::Closed,
            to: PeerState::Connecting,
        };
        assert!(err.to_string().contains("Closed"));
        assert!(err.to_string().contains("Connecting"));
    }

    #[test]
    fn test_peer_limit_display() {
        let err = SwarmError::PeerLimitExceeded { limit: 24 };
        assert_eq!(err.to_string(), "peer limit of 24 exceeded");
    }
}
