//! Shared test doubles: an in-process DHT hub wiring swarms together over
//! memory transports, and a relay dialer backed by the in-process server.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use webswarm::transport::memory_pair;
use webswarm::{
    Dht, DhtDiscovery, DiscoveryEvent, Duplex, JoinOpts, PeerId, PeerInfo, RelayDialer,
    RelayServer, SwarmError, SwarmEvent, TopicKey,
};

/// One announce/lookup session on the hub.
pub struct HubSession {
    topic: TopicKey,
    owner: PeerId,
    events: broadcast::Sender<DiscoveryEvent>,
    /// Peers present before this session subscribed, replayed on subscribe.
    backlog: Mutex<Vec<DiscoveryEvent>>,
    hub: Arc<HubInner>,
}

struct HubInner {
    members: RwLock<Vec<(TopicKey, PeerId, Arc<HubSession>)>>,
    unreachable: RwLock<Vec<PeerId>>,
}

/// In-process DHT shared by every node in a test.
#[derive(Clone)]
pub struct MockHub {
    inner: Arc<HubInner>,
}

impl Default for MockHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                members: RwLock::new(Vec::new()),
                unreachable: RwLock::new(Vec::new()),
            }),
        }
    }

    /// The DHT handle for one node.
    pub fn node(&self, peer: PeerId) -> Arc<MockDht> {
        Arc::new(MockDht {
            hub: self.inner.clone(),
            peer,
        })
    }

    /// Make direct connections to this peer fail.
    pub fn set_unreachable(&self, peer: PeerId) {
        self.inner.unreachable.write().push(peer);
    }

    /// Re-announce a peer to every other member of a topic, as a flaky DHT
    /// would on repeated lookups.
    pub fn reannounce(&self, topic: TopicKey, peer: PeerId) {
        let members = self.inner.members.read();
        for (t, owner, session) in members.iter() {
            if *t == topic && *owner != peer {
                let _ = session.events.send(DiscoveryEvent::Peer(PeerInfo {
                    peer_id: peer,
                    topic,
                }));
            }
        }
    }
}

pub struct MockDht {
    hub: Arc<HubInner>,
    peer: PeerId,
}

#[async_trait]
impl Dht for MockDht {
    async fn ready(&self) -> Result<(), SwarmError> {
        Ok(())
    }

    async fn join(
        &self,
        topic: TopicKey,
        _opts: JoinOpts,
    ) -> Result<Arc<dyn DhtDiscovery>, SwarmError> {
        let (events, _) = broadcast::channel(64);
        let session = Arc::new(HubSession {
            topic,
            owner: self.peer,
            events,
            backlog: Mutex::new(Vec::new()),
            hub: self.hub.clone(),
        });

        let mut members = self.hub.members.write();
        for (t, owner, other) in members.iter() {
            if *t != topic || *owner == self.peer {
                continue;
            }
            // Tell them about us now; they are already subscribed.
            let _ = other.events.send(DiscoveryEvent::Peer(PeerInfo {
                peer_id: self.peer,
                topic,
            }));
            // We learn about them once our side subscribes.
            session.backlog.lock().push(DiscoveryEvent::Peer(PeerInfo {
                peer_id: *owner,
                topic,
            }));
        }
        members.push((topic, self.peer, session.clone()));
        Ok(session)
    }

    async fn leave(&self, topic: TopicKey) -> Result<(), SwarmError> {
        self.hub
            .members
            .write()
            .retain(|(t, owner, _)| !(*t == topic && *owner == self.peer));
        Ok(())
    }

    async fn connect(&self, peer: PeerId) -> Result<Arc<dyn Duplex>, SwarmError> {
        if self.hub.unreachable.read().contains(&peer) {
            return Err(SwarmError::Dht("peer unreachable".to_string()));
        }
        // Deliver the far end through a session the target shares with us.
        let target = {
            let members = self.hub.members.read();
            let shares_with_caller = |topic: &TopicKey| {
                members
                    .iter()
                    .any(|(t, owner, _)| t == topic && *owner == self.peer)
            };
            members
                .iter()
                .filter(|(_, owner, _)| *owner == peer)
                .find(|(t, _, _)| shares_with_caller(t))
                .or_else(|| members.iter().find(|(_, owner, _)| *owner == peer))
                .map(|(t, _, session)| (*t, session.clone()))
        };
        let Some((topic, session)) = target else {
            return Err(SwarmError::Dht("peer not found".to_string()));
        };

        let (near, far) = memory_pair();
        let _ = session.events.send(DiscoveryEvent::Connection {
            transport: far,
            peer: PeerInfo {
                peer_id: self.peer,
                topic,
            },
        });
        Ok(near)
    }

    async fn destroy(&self) -> Result<(), SwarmError> {
        self.hub
            .members
            .write()
            .retain(|(_, owner, _)| *owner != self.peer);
        Ok(())
    }
}

#[async_trait]
impl DhtDiscovery for HubSession {
    fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        let rx = self.events.subscribe();
        for event in self.backlog.lock().drain(..) {
            let _ = self.events.send(event);
        }
        rx
    }

    async fn flushed(&self) -> Result<Vec<PeerInfo>, SwarmError> {
        let members = self.hub.members.read();
        Ok(members
            .iter()
            .filter(|(t, owner, _)| *t == self.topic && *owner != self.owner)
            .map(|(t, owner, _)| PeerInfo {
                peer_id: *owner,
                topic: *t,
            })
            .collect())
    }

    async fn destroy(&self) -> Result<(), SwarmError> {
        self.hub
            .members
            .write()
            .retain(|(t, owner, _)| !(*t == self.topic && *owner == self.owner));
        Ok(())
    }
}

/// A DHT whose connect attempts never resolve, for timeout scenarios.
pub struct HangingDht;

#[async_trait]
impl Dht for HangingDht {
    async fn ready(&self) -> Result<(), SwarmError> {
        Ok(())
    }

    async fn join(
        &self,
        topic: TopicKey,
        _opts: JoinOpts,
    ) -> Result<Arc<dyn DhtDiscovery>, SwarmError> {
        let (events, _) = broadcast::channel(8);
        Ok(Arc::new(HubSession {
            topic,
            owner: webswarm::KeyPair::generate().peer_id(),
            events,
            backlog: Mutex::new(Vec::new()),
            hub: MockHub::new().inner,
        }))
    }

    async fn leave(&self, _topic: TopicKey) -> Result<(), SwarmError> {
        Ok(())
    }

    async fn connect(&self, _peer: PeerId) -> Result<Arc<dyn Duplex>, SwarmError> {
        std::future::pending().await
    }

    async fn destroy(&self) -> Result<(), SwarmError> {
        Ok(())
    }
}

/// A DHT with no transport at all; joins succeed, connects fail fast.
pub struct OfflineDht;

#[async_trait]
impl Dht for OfflineDht {
    async fn ready(&self) -> Result<(), SwarmError> {
        Ok(())
    }

    async fn join(
        &self,
        topic: TopicKey,
        _opts: JoinOpts,
    ) -> Result<Arc<dyn DhtDiscovery>, SwarmError> {
        let (events, _) = broadcast::channel(8);
        Ok(Arc::new(HubSession {
            topic,
            owner: webswarm::KeyPair::generate().peer_id(),
            events,
            backlog: Mutex::new(Vec::new()),
            hub: MockHub::new().inner,
        }))
    }

    async fn leave(&self, _topic: TopicKey) -> Result<(), SwarmError> {
        Ok(())
    }

    async fn connect(&self, _peer: PeerId) -> Result<Arc<dyn Duplex>, SwarmError> {
        Err(SwarmError::Dht("no direct transport".to_string()))
    }

    async fn destroy(&self) -> Result<(), SwarmError> {
        Ok(())
    }
}

/// Dials the in-process relay server over memory transports.
pub struct MemoryRelayDialer {
    server: RelayServer,
}

impl MemoryRelayDialer {
    pub fn new(server: RelayServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl RelayDialer for MemoryRelayDialer {
    async fn dial(&self, _url: &str) -> Result<Arc<dyn Duplex>, SwarmError> {
        let (near, far) = memory_pair();
        self.server.attach(far);
        Ok(near)
    }
}

/// A dialer that always refuses, for relay-failure scenarios.
pub struct RefusingDialer;

#[async_trait]
impl RelayDialer for RefusingDialer {
    async fn dial(&self, url: &str) -> Result<Arc<dyn Duplex>, SwarmError> {
        Err(SwarmError::Relay(format!("dial refused: {url}")))
    }
}

/// Wait for the next connection handle, failing the test after 2s.
pub async fn wait_incoming(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<webswarm::Connection>,
) -> webswarm::Connection {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for connection")
        .expect("incoming channel closed")
}

/// Wait for an event matching the predicate, failing the test after 2s.
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<SwarmEvent>,
    mut pred: F,
) -> SwarmEvent
where
    F: FnMut(&SwarmEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
