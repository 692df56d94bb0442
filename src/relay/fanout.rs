//! Relay fan-out — multiplexing logical connections over shared relay links
//!
//! One link per relay URL, opened lazily. Inbound envelopes are demultiplexed
//! by connection id; outbound writes per logical connection are serialized
//! through a single writer task per link, so ordering holds within one link
//! but not across links. A failing link errors out every logical connection
//! multiplexed over it; there is no implicit re-homing onto another relay.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use super::envelope::{Envelope, EnvelopeKind};
use crate::dht::PeerInfo;
use crate::error::SwarmError;
use crate::events::SwarmEvent;
use crate::identity::PeerId;
use crate::topic::TopicKey;
use crate::transport::{Duplex, RelayDialer, StreamEvent};

/// Events surfaced by the pool to the swarm's driver task.
pub enum PoolEvent {
    /// A relay reported a peer for one of our topics.
    PeerDiscovered { info: PeerInfo, url: String },
    /// A remote peer opened a logical connection to us over a relay.
    IncomingConnection {
        connection_id: String,
        info: PeerInfo,
        url: String,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        writer: RelayWriter,
    },
}

type ChannelMap = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<StreamEvent>>>>;

/// One transport connection to a relay server, shared by the logical
/// connections multiplexed over it. Reference-counted by its registered
/// logical connections and joined topics; closed when the last referent is
/// gone or the swarm is destroyed.
#[derive(Clone)]
struct LinkHandle {
    url: String,
    outbound: mpsc::UnboundedSender<Envelope>,
    channels: ChannelMap,
    joined: Arc<RwLock<HashSet<TopicKey>>>,
    transport: Arc<dyn Duplex>,
}

impl LinkHandle {
    fn is_idle(&self) -> bool {
        self.channels.read().is_empty() && self.joined.read().is_empty()
    }
}

struct PoolInner {
    local_peer: PeerId,
    dialer: Arc<dyn RelayDialer>,
    links: Mutex<HashMap<String, LinkHandle>>,
    events: broadcast::Sender<SwarmEvent>,
    pool_tx: mpsc::UnboundedSender<PoolEvent>,
}

/// The relay link pool for one swarm instance.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

/// Write half of one logical relay connection.
#[derive(Clone)]
pub struct RelayWriter {
    connection_id: String,
    url: String,
    outbound: mpsc::UnboundedSender<Envelope>,
    pool: RelayPool,
}

impl RelayWriter {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Queue one data envelope, preserving per-connection write order.
    pub fn write(&self, bytes: &[u8]) -> Result<(), SwarmError> {
        self.outbound
            .send(Envelope::data(&self.connection_id, bytes.to_vec()))
            .map_err(|_| SwarmError::Relay("relay link is closed".to_string()))
    }

    /// Announce the close to the remote side and drop the local channel.
    pub async fn destroy(&self) {
        let _ = self
            .outbound
            .send(Envelope::connection_close(&self.connection_id));
        self.pool
            .close_connection(&self.url, &self.connection_id)
            .await;
    }
}

impl RelayPool {
    pub fn new(
        local_peer: PeerId,
        dialer: Arc<dyn RelayDialer>,
        events: broadcast::Sender<SwarmEvent>,
        pool_tx: mpsc::UnboundedSender<PoolEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                local_peer,
                dialer,
                links: Mutex::new(HashMap::new()),
                events,
                pool_tx,
            }),
        }
    }

    /// Number of open relay links.
    pub async fn link_count(&self) -> usize {
        self.inner.links.lock().await.len()
    }

    /// Open (or reuse) the link for a relay URL.
    async fn ensure_link(&self, url: &str) -> Result<LinkHandle, SwarmError> {
        let mut links = self.inner.links.lock().await;
        if let Some(link) = links.get(url) {
            return Ok(link.clone());
        }

        let transport = self.inner.dialer.dial(url).await?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let link = LinkHandle {
            url: url.to_string(),
            outbound,
            channels: Arc::new(RwLock::new(HashMap::new())),
            joined: Arc::new(RwLock::new(HashSet::new())),
            transport: transport.clone(),
        };
        links.insert(url.to_string(), link.clone());
        drop(links);

        self.spawn_writer(url.to_string(), transport.clone(), outbound_rx);
        self.spawn_demux(link.clone());

        info!(url, "relay link established");
        let _ = self.inner.events.send(SwarmEvent::RelayConnected {
            url: url.to_string(),
        });
        Ok(link)
    }

    /// Single writer task per link: envelopes go out in queue order.
    fn spawn_writer(
        &self,
        url: String,
        transport: Arc<dyn Duplex>,
        mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
    ) {
        tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let bytes = match envelope.to_bytes() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(%url, error = %e, "failed to encode relay envelope");
                        continue;
                    }
                };
                if let Err(e) = transport.write(&bytes).await {
                    warn!(%url, error = %e, "relay link write failed");
                    break;
                }
            }
        });
    }

    fn spawn_demux(&self, link: LinkHandle) {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                match link.transport.next_event().await {
                    StreamEvent::Data(bytes) => pool.handle_envelope(&link, &bytes),
                    StreamEvent::Closed => {
                        pool.fail_link(&link, None).await;
                        break;
                    }
                    StreamEvent::Errored(reason) => {
                        pool.fail_link(&link, Some(reason)).await;
                        break;
                    }
                }
            }
        });
    }

    /// Route one inbound envelope. Parse failures and unknown connection ids
    /// are logged and dropped, never propagated.
    fn handle_envelope(&self, link: &LinkHandle, bytes: &[u8]) {
        let envelope = match Envelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(url = %link.url, error = %e, "dropping malformed relay envelope");
                return;
            }
        };

        match envelope.kind {
            EnvelopeKind::Data => {
                let Some(id) = envelope.connection_id.as_deref() else {
                    warn!(url = %link.url, "data envelope without connection id dropped");
                    return;
                };
                let channels = link.channels.read();
                match channels.get(id) {
                    Some(tx) => {
                        let _ = tx.send(StreamEvent::Data(envelope.data.unwrap_or_default()));
                    }
                    None => {
                        // The peer may have already closed locally.
                        warn!(url = %link.url, connection_id = id, "envelope for unknown connection dropped");
                    }
                }
            }
            EnvelopeKind::ConnectionClose => {
                let Some(id) = envelope.connection_id.as_deref() else {
                    warn!(url = %link.url, "close envelope without connection id dropped");
                    return;
                };
                match link.channels.write().remove(id) {
                    Some(tx) => {
                        let _ = tx.send(StreamEvent::Closed);
                    }
                    None => {
                        warn!(url = %link.url, connection_id = id, "envelope for unknown connection dropped");
                    }
                }
            }
            EnvelopeKind::ConnectionOpen => {
                let (Some(id), Some(peer), Some(topic)) = (
                    envelope.connection_id.clone(),
                    envelope.peer_id(),
                    envelope.topic_key(),
                ) else {
                    warn!(url = %link.url, "malformed connection:open dropped");
                    return;
                };
                if link.channels.read().contains_key(&id) {
                    warn!(url = %link.url, connection_id = %id, "duplicate connection:open dropped");
                    return;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                link.channels.write().insert(id.clone(), tx);
                let writer = RelayWriter {
                    connection_id: id.clone(),
                    url: link.url.clone(),
                    outbound: link.outbound.clone(),
                    pool: self.clone(),
                };
                let event = PoolEvent::IncomingConnection {
                    connection_id: id.clone(),
                    info: PeerInfo {
                        peer_id: peer,
                        topic,
                    },
                    url: link.url.clone(),
                    events: rx,
                    writer,
                };
                if self.inner.pool_tx.send(event).is_err() {
                    link.channels.write().remove(&id);
                }
            }
            EnvelopeKind::PeerDiscovery => {
                let (Some(peer), Some(topic)) = (envelope.peer_id(), envelope.topic_key()) else {
                    warn!(url = %link.url, "malformed peer:discovery dropped");
                    return;
                };
                if peer == self.inner.local_peer {
                    return;
                }
                let _ = self.inner.pool_tx.send(PoolEvent::PeerDiscovered {
                    info: PeerInfo {
                        peer_id: peer,
                        topic,
                    },
                    url: link.url.clone(),
                });
            }
            EnvelopeKind::TopicJoin | EnvelopeKind::TopicLeave => {
                debug!(url = %link.url, "ignoring server-bound envelope");
            }
        }
    }

    /// A link died: error out every logical connection multiplexed over it.
    async fn fail_link(&self, link: &LinkHandle, reason: Option<String>) {
        self.inner.links.lock().await.remove(&link.url);
        let channels: Vec<_> = link.channels.write().drain().collect();
        for (id, tx) in channels {
            debug!(url = %link.url, connection_id = %id, "logical connection lost with relay link");
            let _ = tx.send(StreamEvent::Errored(format!(
                "relay link {} lost",
                link.url
            )));
        }
        link.joined.write().clear();
        match reason {
            Some(reason) => {
                warn!(url = %link.url, %reason, "relay link failed");
                let _ = self.inner.events.send(SwarmEvent::RelayError {
                    url: link.url.clone(),
                    reason,
                });
            }
            None => {
                info!(url = %link.url, "relay link closed");
                let _ = self.inner.events.send(SwarmEvent::RelayDisconnected {
                    url: link.url.clone(),
                });
            }
        }
    }

    fn join_link_topic(&self, link: &LinkHandle, topic: TopicKey) -> Result<(), SwarmError> {
        if link.joined.read().contains(&topic) {
            return Ok(());
        }
        link.outbound
            .send(Envelope::topic_join(&topic, &self.inner.local_peer))
            .map_err(|_| SwarmError::Relay("relay link is closed".to_string()))?;
        link.joined.write().insert(topic);
        Ok(())
    }

    /// Announce a topic on every configured relay, opening links lazily.
    /// Failures per relay are isolated.
    pub async fn join_topic(&self, urls: &[String], topic: TopicKey) {
        for url in urls {
            match self.ensure_link(url).await {
                Ok(link) => {
                    if let Err(e) = self.join_link_topic(&link, topic) {
                        warn!(%url, error = %e, "relay topic join failed");
                    }
                }
                Err(e) => warn!(%url, error = %e, "relay link unavailable"),
            }
        }
    }

    /// Withdraw a topic from every open link, closing links left idle.
    pub async fn leave_topic(&self, topic: TopicKey) {
        let links: Vec<_> = {
            let links = self.inner.links.lock().await;
            links.values().cloned().collect()
        };
        for link in &links {
            if link.joined.write().remove(&topic) {
                let _ = link
                    .outbound
                    .send(Envelope::topic_leave(&topic, &self.inner.local_peer));
            }
        }
        for link in links {
            self.close_if_idle(&link).await;
        }
    }

    /// Open a logical connection to a peer, trying relay URLs in order.
    pub async fn open_connection(
        &self,
        urls: &[String],
        peer: PeerId,
        topic: TopicKey,
    ) -> Result<
        (
            String,
            mpsc::UnboundedReceiver<StreamEvent>,
            RelayWriter,
        ),
        SwarmError,
    > {
        let mut last_err = None;
        for url in urls {
            let link = match self.ensure_link(url).await {
                Ok(link) => link,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            // Register with the relay so replies can be routed back to us.
            if let Err(e) = self.join_link_topic(&link, topic) {
                last_err = Some(e);
                continue;
            }
            let id = uuid::Uuid::new_v4().to_string();
            let (tx, rx) = mpsc::unbounded_channel();
            link.channels.write().insert(id.clone(), tx);
            if link
                .outbound
                .send(Envelope::connection_open(&id, &peer, &topic))
                .is_err()
            {
                link.channels.write().remove(&id);
                last_err = Some(SwarmError::Relay("relay link is closed".to_string()));
                continue;
            }
            let writer = RelayWriter {
                connection_id: id.clone(),
                url: link.url.clone(),
                outbound: link.outbound.clone(),
                pool: self.clone(),
            };
            return Ok((id, rx, writer));
        }
        Err(last_err
            .unwrap_or_else(|| SwarmError::Relay("no relay servers configured".to_string())))
    }

    /// Deregister a logical connection, closing its link when idle.
    pub async fn close_connection(&self, url: &str, connection_id: &str) {
        let link = {
            let links = self.inner.links.lock().await;
            links.get(url).cloned()
        };
        let Some(link) = link else {
            return;
        };
        if let Some(tx) = link.channels.write().remove(connection_id) {
            let _ = tx.send(StreamEvent::Closed);
        }
        self.close_if_idle(&link).await;
    }

    async fn close_if_idle(&self, link: &LinkHandle) {
        if !link.is_idle() {
            return;
        }
        let removed = self.inner.links.lock().await.remove(&link.url).is_some();
        if removed {
            debug!(url = %link.url, "closing idle relay link");
            link.transport.destroy().await;
        }
    }

    /// Close every link. Used by swarm destroy; failures are isolated.
    pub async fn destroy(&self) {
        let links: Vec<_> = self.inner.links.lock().await.drain().collect();
        for (url, link) in links {
            debug!(%url, "closing relay link on destroy");
            link.transport.destroy().await;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
