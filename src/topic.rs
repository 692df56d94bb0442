//! Topic registry — normalized topic identifiers and their discovery handles

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::dht::{Dht, DhtDiscovery, DiscoveryEvent, JoinOpts, PeerInfo};
use crate::error::SwarmError;
use crate::identity::PeerId;

/// Topic input as accepted from the application: raw bytes or a text label.
#[derive(Debug, Clone)]
pub enum Topic {
    Bytes(Vec<u8>),
    Label(String),
}

impl From<&str> for Topic {
    fn from(label: &str) -> Self {
        Topic::Label(label.to_string())
    }
}

impl From<String> for Topic {
    fn from(label: String) -> Self {
        Topic::Label(label)
    }
}

impl From<Vec<u8>> for Topic {
    fn from(bytes: Vec<u8>) -> Self {
        Topic::Bytes(bytes)
    }
}

impl From<[u8; 32]> for Topic {
    fn from(bytes: [u8; 32]) -> Self {
        Topic::Bytes(bytes.to_vec())
    }
}

/// Normalized fixed-length topic identifier (content hash).
///
/// Text labels and binary identifiers for the same topic normalize to the
/// same key; the hex encoding is the canonical index form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicKey([u8; 32]);

impl TopicKey {
    /// Normalize a topic input to its canonical key.
    ///
    /// Binary input must be exactly 32 bytes; text labels are hashed to
    /// 32 bytes. Empty input fails with `InvalidTopic`.
    pub fn normalize(topic: &Topic) -> Result<Self, SwarmError> {
        match topic {
            Topic::Bytes(bytes) => {
                if bytes.is_empty() {
                    return Err(SwarmError::InvalidTopic("empty topic".to_string()));
                }
                let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    SwarmError::InvalidTopic(format!(
                        "binary topic must be 32 bytes, got {}",
                        bytes.len()
                    ))
                })?;
                Ok(Self(bytes))
            }
            Topic::Label(label) => {
                if label.is_empty() {
                    return Err(SwarmError::InvalidTopic("empty topic".to_string()));
                }
                Ok(Self(*blake3::hash(label.as_bytes()).as_bytes()))
            }
        }
    }

    /// A synthetic topic key scoping ad hoc `connect(peer)` attempts, which
    /// have no application topic but still need a peer-table scope.
    pub fn direct(peer: &PeerId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"webswarm:direct");
        hasher.update(peer.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Canonical hex form used for indexing and wire encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the canonical hex form.
    pub fn from_hex(s: &str) -> Result<Self, SwarmError> {
        let bytes = hex::decode(s)
            .map_err(|e| SwarmError::InvalidTopic(format!("invalid topic hex: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SwarmError::InvalidTopic("topic key must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicKey({}…)", &self.to_hex()[..8])
    }
}

/// Outcome of a bounded wait on the discovered peer set, so callers can tell
/// "no peers yet" apart from "lookup failed" (which is an `Err`).
#[derive(Debug, Clone)]
pub enum FlushOutcome {
    Flushed(Vec<PeerInfo>),
    TimedOut,
}

/// Per-topic handle bound to the external DHT announce/lookup session.
#[derive(Clone)]
pub struct Discovery {
    topic: TopicKey,
    announce: bool,
    lookup: bool,
    session: Arc<dyn DhtDiscovery>,
}

impl Discovery {
    pub(crate) fn new(topic: TopicKey, opts: JoinOpts, session: Arc<dyn DhtDiscovery>) -> Self {
        Self {
            topic,
            announce: opts.announce,
            lookup: opts.lookup,
            session,
        }
    }

    pub fn topic(&self) -> TopicKey {
        self.topic
    }

    pub fn announce(&self) -> bool {
        self.announce
    }

    pub fn lookup(&self) -> bool {
        self.lookup
    }

    /// Subscribe to peer and inbound-connection events for this topic.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.session.subscribe()
    }

    /// The currently known peer set.
    pub async fn flushed(&self) -> Result<Vec<PeerInfo>, SwarmError> {
        self.session.flushed().await
    }

    /// Bounded wait for the known peer set.
    pub async fn flushed_within(&self, timeout: Duration) -> Result<FlushOutcome, SwarmError> {
        match tokio::time::timeout(timeout, self.session.flushed()).await {
            Ok(Ok(peers)) => Ok(FlushOutcome::Flushed(peers)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(FlushOutcome::TimedOut),
        }
    }

    /// Terminate the discovery session.
    pub async fn destroy(&self) -> Result<(), SwarmError> {
        self.session.destroy().await
    }
}

impl fmt::Debug for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discovery")
            .field("topic", &self.topic)
            .field("announce", &self.announce)
            .field("lookup", &self.lookup)
            .finish()
    }
}

/// Upper bound on one discovery teardown. A hung session is logged and left
/// behind so the rest of a shutdown can complete.
pub(crate) const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns normalized topics and their discovery handles. One discovery per
/// active topic; entries here, peer-table topic scopes and discovery handles
/// stay mutually consistent under the facade's single-writer discipline.
pub struct TopicRegistry {
    dht: Arc<dyn Dht>,
    entries: HashMap<TopicKey, Discovery>,
}

impl TopicRegistry {
    pub fn new(dht: Arc<dyn Dht>) -> Self {
        Self {
            dht,
            entries: HashMap::new(),
        }
    }

    /// Register a topic, initiating the external announce/lookup session.
    ///
    /// Idempotent per topic key: an already-registered topic returns its
    /// existing discovery handle unchanged.
    pub async fn register(
        &mut self,
        topic: TopicKey,
        opts: JoinOpts,
    ) -> Result<Discovery, SwarmError> {
        if let Some(existing) = self.entries.get(&topic) {
            debug!(topic = %topic.to_hex(), "topic already registered");
            return Ok(existing.clone());
        }
        let session = self.dht.join(topic, opts).await?;
        let discovery = Discovery::new(topic, opts, session);
        self.entries.insert(topic, discovery.clone());
        info!(topic = %topic.to_hex(), announce = opts.announce, lookup = opts.lookup, "topic registered");
        Ok(discovery)
    }

    pub fn get(&self, topic: &TopicKey) -> Option<&Discovery> {
        self.entries.get(topic)
    }

    pub fn contains(&self, topic: &TopicKey) -> bool {
        self.entries.contains_key(topic)
    }

    pub fn topics(&self) -> Vec<TopicKey> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destroy the topic's discovery session and drop the entry. No-op when
    /// the topic is not registered. The caller purges peers scoped to the
    /// topic as part of the same operation.
    pub async fn unregister(&mut self, topic: &TopicKey) -> bool {
        let Some(discovery) = self.entries.remove(topic) else {
            return false;
        };
        Self::destroy_bounded(topic, &discovery).await;
        info!(topic = %topic.to_hex(), "topic unregistered");
        true
    }

    /// Unregister every topic. Used by swarm destroy.
    pub async fn clear(&mut self) {
        for (topic, discovery) in self.entries.drain() {
            Self::destroy_bounded(&topic, &discovery).await;
        }
    }

    async fn destroy_bounded(topic: &TopicKey, discovery: &Discovery) {
        match tokio::time::timeout(TEARDOWN_TIMEOUT, discovery.destroy()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(topic = %topic.to_hex(), error = %e, "discovery teardown failed");
            }
            Err(_) => {
                warn!(topic = %topic.to_hex(), "discovery teardown timed out");
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullDiscovery {
        events: broadcast::Sender<DiscoveryEvent>,
        destroyed: AtomicUsize,
    }

    #[async_trait]
    impl DhtDiscovery for NullDiscovery {
        fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
            self.events.subscribe()
        }

        async fn flushed(&self) -> Result<Vec<PeerInfo>, SwarmError> {
            Ok(Vec::new())
        }

        async fn destroy(&self) -> Result<(), SwarmError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NullDht {
        joins: AtomicUsize,
    }

    #[async_trait]
    impl Dht for NullDht {
        async fn ready(&self) -> Result<(), SwarmError> {
            Ok(())
        }

        async fn join(
            &self,
            _topic: TopicKey,
            _opts: JoinOpts,
        ) -> Result<Arc<dyn DhtDiscovery>, SwarmError> {
            self.joins.fetch_add(1, Ordering::SeqCst);
            let (events, _) = broadcast::channel(8);
            Ok(Arc::new(NullDiscovery {
                events,
                destroyed: AtomicUsize::new(0),
            }))
        }

        async fn leave(&self, _topic: TopicKey) -> Result<(), SwarmError> {
            Ok(())
        }

        async fn connect(
            &self,
            _peer: PeerId,
        ) -> Result<Arc<dyn crate::transport::Duplex>, SwarmError> {
            Err(SwarmError::Dht("no transport".to_string()))
        }

        async fn destroy(&self) -> Result<(), SwarmError> {
            Ok(())
        }
    }

    fn null_dht() -> Arc<NullDht> {
        Arc::new(NullDht {
            joins: AtomicUsize::new(0),
        })
    }

    /// Discovery whose teardown never completes.
    struct StuckDiscovery {
        events: broadcast::Sender<DiscoveryEvent>,
    }

    #[async_trait]
    impl DhtDiscovery for StuckDiscovery {
        fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
            self.events.subscribe()
        }

        async fn flushed(&self) -> Result<Vec<PeerInfo>, SwarmError> {
            Ok(Vec::new())
        }

        async fn destroy(&self) -> Result<(), SwarmError> {
            std::future::pending().await
        }
    }

    struct StuckDht;

    #[async_trait]
    impl Dht for StuckDht {
        async fn ready(&self) -> Result<(), SwarmError> {
            Ok(())
        }

        async fn join(
            &self,
            _topic: TopicKey,
            _opts: JoinOpts,
        ) -> Result<Arc<dyn DhtDiscovery>, SwarmError> {
            let (events, _) = broadcast::channel(8);
            Ok(Arc::new(StuckDiscovery { events }))
        }

        async fn leave(&self, _topic: TopicKey) -> Result<(), SwarmError> {
            Ok(())
        }

        async fn connect(
            &self,
            _peer: PeerId,
        ) -> Result<Arc<dyn crate::transport::Duplex>, SwarmError> {
            Err(SwarmError::Dht("no transport".to_string()))
        }

        async fn destroy(&self) -> Result<(), SwarmError> {
            Ok(())
        }
    }

    #[test]
    fn test_normalize_label_and_bytes_agree_on_canonical_form() {
        let from_label = TopicKey::normalize(&Topic::from("my-topic")).unwrap();
        let raw = *blake3::hash(b"my-topic").as_bytes();
        let from_bytes = TopicKey::normalize(&Topic::from(raw)).unwrap();
        assert_eq!(from_label, from_bytes);
        assert_eq!(from_label.to_hex(), from_bytes.to_hex());
    }

    #[test]
    fn test_normalize_rejects_empty_input() {
        assert!(matches!(
            TopicKey::normalize(&Topic::Label(String::new())),
            Err(SwarmError::InvalidTopic(_))
        ));
        assert!(matches!(
            TopicKey::normalize(&Topic::Bytes(Vec::new())),
            Err(SwarmError::InvalidTopic(_))
        ));
    }

    #[test]
    fn test_normalize_rejects_wrong_length_binary() {
        assert!(matches!(
            TopicKey::normalize(&Topic::Bytes(vec![1, 2, 3])),
            Err(SwarmError::InvalidTopic(_))
        ));
    }

    #[test]
    fn test_topic_key_hex_roundtrip() {
        let key = TopicKey::normalize(&Topic::from("roundtrip")).unwrap();
        assert_eq!(TopicKey::from_hex(&key.to_hex()).unwrap(), key);
    }

    #[test]
    fn test_direct_keys_differ_per_peer() {
        let a = crate::identity::KeyPair::generate().peer_id();
        let b = crate::identity::KeyPair::generate().peer_id();
        assert_ne!(TopicKey::direct(&a), TopicKey::direct(&b));
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let dht = null_dht();
        let mut registry = TopicRegistry::new(dht.clone());
        let key = TopicKey::normalize(&Topic::from("idempotent")).unwrap();

        registry.register(key, JoinOpts::default()).await.unwrap();
        registry.register(key, JoinOpts::default()).await.unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(dht.joins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregister_absent_topic_is_noop() {
        let mut registry = TopicRegistry::new(null_dht());
        let key = TopicKey::normalize(&Topic::from("never-joined")).unwrap();
        assert!(!registry.unregister(&key).await);
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let mut registry = TopicRegistry::new(null_dht());
        for label in ["a", "b", "c"] {
            let key = TopicKey::normalize(&Topic::from(label)).unwrap();
            registry.register(key, JoinOpts::default()).await.unwrap();
        }
        assert_eq!(registry.len(), 3);
        registry.clear().await;
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_teardown_cannot_block_clear() {
        let mut registry = TopicRegistry::new(Arc::new(StuckDht));
        for label in ["stuck-a", "stuck-b"] {
            let key = TopicKey::normalize(&Topic::from(label)).unwrap();
            registry.register(key, JoinOpts::default()).await.unwrap();
        }

        registry.clear().await;
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_teardown_cannot_block_unregister() {
        let mut registry = TopicRegistry::new(Arc::new(StuckDht));
        let key = TopicKey::normalize(&Topic::from("stuck")).unwrap();
        registry.register(key, JoinOpts::default()).await.unwrap();

        assert!(registry.unregister(&key).await);
        assert!(registry.is_empty());
    }
}
