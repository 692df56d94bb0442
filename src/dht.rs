//! External DHT collaborator contract
//!
//! The swarm does not implement routing or lookup; it drives an external
//! distributed hash table service through these traits.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::SwarmError;
use crate::identity::PeerId;
use crate::topic::TopicKey;
use crate::transport::Duplex;

/// Options for a topic announce/lookup session.
#[derive(Debug, Clone, Copy)]
pub struct JoinOpts {
    pub announce: bool,
    pub lookup: bool,
    /// Publish the local listening address alongside the announce. Set from
    /// the swarm configuration, not per call.
    pub announce_local_address: bool,
}

impl Default for JoinOpts {
    fn default() -> Self {
        Self {
            announce: true,
            lookup: true,
            announce_local_address: false,
        }
    }
}

/// A peer reported by the DHT (or a relay) for a topic.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub topic: TopicKey,
}

/// Events emitted by an active discovery session.
#[derive(Clone)]
pub enum DiscoveryEvent {
    /// A peer was found for the session's topic.
    Peer(PeerInfo),
    /// A remote peer established an inbound transport to us.
    Connection {
        transport: Arc<dyn Duplex>,
        peer: PeerInfo,
    },
}

impl fmt::Debug for DiscoveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryEvent::Peer(info) => write!(f, "Peer({:?})", info),
            DiscoveryEvent::Connection { peer, .. } => write!(f, "Connection({:?})", peer),
        }
    }
}

/// The external DHT service.
#[async_trait]
pub trait Dht: Send + Sync {
    /// Resolve once the DHT is ready to serve requests.
    async fn ready(&self) -> Result<(), SwarmError>;

    /// Begin an announce/lookup session for a topic.
    async fn join(
        &self,
        topic: TopicKey,
        opts: JoinOpts,
    ) -> Result<Arc<dyn DhtDiscovery>, SwarmError>;

    /// Stop announcing/looking up a topic.
    async fn leave(&self, topic: TopicKey) -> Result<(), SwarmError>;

    /// Open a direct transport to a peer.
    async fn connect(&self, peer: PeerId) -> Result<Arc<dyn Duplex>, SwarmError>;

    /// Release the DHT resource.
    async fn destroy(&self) -> Result<(), SwarmError>;
}

/// One active announce/lookup session, owned by the topic registry.
#[async_trait]
pub trait DhtDiscovery: Send + Sync {
    /// Subscribe to peer and inbound-connection events for this session.
    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent>;

    /// The currently known peer set for the session.
    async fn flushed(&self) -> Result<Vec<PeerInfo>, SwarmError>;

    /// Terminate the session.
    async fn destroy(&self) -> Result<(), SwarmError>;
}
