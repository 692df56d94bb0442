//! Swarm facade — topic membership, peer lifecycle and connection supervision
//!
//! One `Swarm` owns a topic registry, a peer table and the live connection
//! set behind a single async mutex: every mutation of that state goes through
//! one writer at a time, so discovery races, duplicate closes and
//! destroy-during-connect interleavings resolve deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SwarmConfig;
use crate::connection::{
    should_initiate, Connection, ConnectionCtl, ConnectionWriter, EventSource,
};
use crate::dht::{Dht, DiscoveryEvent, JoinOpts, PeerInfo};
use crate::error::SwarmError;
use crate::events::{ConnectionInfo, SwarmEvent};
use crate::identity::PeerId;
use crate::peer::{unix_ms, PeerState, PeerTable, TransportKind};
use crate::relay::{PoolEvent, RelayPool};
use crate::topic::{Discovery, Topic, TopicKey, TopicRegistry, TEARDOWN_TIMEOUT};
use crate::transport::{Duplex, RelayDialer, StreamEvent, TcpRelayDialer};

/// Capacity of the lifecycle event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

struct SwarmState {
    destroyed: bool,
    registry: TopicRegistry,
    peers: PeerTable,
    /// In-flight connection attempts, keyed like the peer table.
    attempts: HashSet<(PeerId, TopicKey)>,
    /// Live connections by connection id. Removal here is the exactly-once
    /// gate for close and error reporting.
    connections: HashMap<String, ConnectionCtl>,
    discovery_tasks: HashMap<TopicKey, JoinHandle<()>>,
    driver: Option<JoinHandle<()>>,
}

struct Shared {
    config: SwarmConfig,
    local_peer: PeerId,
    dht: Arc<dyn Dht>,
    /// Readiness handshake with the DHT, awaited once before its first use.
    dht_ready: OnceCell<()>,
    pool: RelayPool,
    state: Mutex<SwarmState>,
    events: broadcast::Sender<SwarmEvent>,
    incoming: mpsc::UnboundedSender<Connection>,
}

/// A peer-discovery and connection-lifecycle manager over an external DHT,
/// with a relay fallback for unreachable or constrained peers.
pub struct Swarm {
    shared: Arc<Shared>,
}

impl Swarm {
    /// Create a swarm over the given DHT, dialing relays over framed TCP.
    ///
    /// The returned receiver yields every connection the swarm establishes
    /// that the caller did not ask for explicitly: inbound connections and
    /// automatic connections to discovered peers.
    pub fn new(
        config: SwarmConfig,
        dht: Arc<dyn Dht>,
    ) -> (Self, mpsc::UnboundedReceiver<Connection>) {
        Self::with_dialer(config, dht, Arc::new(TcpRelayDialer))
    }

    /// Create a swarm with a custom relay dialer.
    pub fn with_dialer(
        config: SwarmConfig,
        dht: Arc<dyn Dht>,
        dialer: Arc<dyn RelayDialer>,
    ) -> (Self, mpsc::UnboundedReceiver<Connection>) {
        let local_peer = config.keypair.peer_id();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (incoming, incoming_rx) = mpsc::unbounded_channel();
        let (pool_tx, mut pool_rx) = mpsc::unbounded_channel();
        let pool = RelayPool::new(local_peer, dialer, events.clone(), pool_tx);

        let shared = Arc::new(Shared {
            local_peer,
            dht: dht.clone(),
            dht_ready: OnceCell::new(),
            pool,
            state: Mutex::new(SwarmState {
                destroyed: false,
                registry: TopicRegistry::new(dht),
                peers: PeerTable::new(config.max_peers),
                attempts: HashSet::new(),
                connections: HashMap::new(),
                discovery_tasks: HashMap::new(),
                driver: None,
            }),
            events,
            incoming,
            config,
        });

        let driver_shared = shared.clone();
        let driver = tokio::spawn(async move {
            while let Some(event) = pool_rx.recv().await {
                match event {
                    PoolEvent::PeerDiscovered { info, url } => {
                        debug!(peer = %info.peer_id, %url, "peer discovered via relay");
                        driver_shared.handle_discovered_peer(info).await;
                    }
                    PoolEvent::IncomingConnection {
                        connection_id,
                        info,
                        events,
                        writer,
                        ..
                    } => {
                        driver_shared
                            .adopt_relay(connection_id, info, events, writer)
                            .await;
                    }
                }
            }
        });
        // No other handle exists yet, so the lock is free.
        if let Ok(mut state) = shared.state.try_lock() {
            state.driver = Some(driver);
        }

        (Self { shared }, incoming_rx)
    }

    /// This instance's peer identity.
    pub fn local_peer_id(&self) -> PeerId {
        self.shared.local_peer
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.shared.events.subscribe()
    }

    /// Join a topic, starting announce/lookup on the DHT. Idempotent per
    /// normalized topic key.
    pub async fn join(
        &self,
        topic: impl Into<Topic>,
        opts: JoinOpts,
    ) -> Result<Discovery, SwarmError> {
        let key = TopicKey::normalize(&topic.into())?;
        let mut state = self.shared.state.lock().await;
        if state.destroyed {
            return Err(SwarmError::Destroyed);
        }
        if let Some(existing) = state.registry.get(&key) {
            return Ok(existing.clone());
        }
        // No point announcing a topic we could not admit a single peer for.
        state.peers.capacity_check()?;
        self.shared.await_dht_ready().await?;

        let opts = JoinOpts {
            announce_local_address: self.shared.config.announce_local_address,
            ..opts
        };
        let discovery = state.registry.register(key, opts).await?;
        // Constrained runtimes discover exclusively through the relays, so
        // announce the topic there as well.
        if !self.shared.config.direct_transport {
            self.shared
                .pool
                .join_topic(self.shared.config.relay_urls(), key)
                .await;
        }

        let task = self.spawn_discovery_task(key, &discovery);
        state.discovery_tasks.insert(key, task);
        Ok(discovery)
    }

    fn spawn_discovery_task(&self, key: TopicKey, discovery: &Discovery) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let mut rx = discovery.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(DiscoveryEvent::Peer(info)) => {
                        shared.handle_discovered_peer(info).await;
                    }
                    Ok(DiscoveryEvent::Connection { transport, peer }) => {
                        shared.adopt_direct(transport, peer).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(topic = %key.to_hex(), missed, "discovery events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Leave a topic: stop discovery and tear down every connection scoped to
    /// it. Leaving a topic that was never joined is a silent no-op.
    pub async fn leave(&self, topic: impl Into<Topic>) -> Result<(), SwarmError> {
        let key = TopicKey::normalize(&topic.into())?;
        let mut state = self.shared.state.lock().await;
        if state.destroyed {
            return Err(SwarmError::Destroyed);
        }
        if !state.registry.unregister(&key).await {
            debug!(topic = %key.to_hex(), "leave of unknown topic ignored");
            return Ok(());
        }
        if let Some(task) = state.discovery_tasks.remove(&key) {
            task.abort();
        }
        self.shared.pool.leave_topic(key).await;

        state.attempts.retain(|(_, t)| t != &key);
        let records = state.peers.remove_by_topic(&key);
        for record in records {
            let Some(id) = record.connection_id else {
                continue;
            };
            if let Some(ctl) = state.connections.remove(&id) {
                ctl.pump.abort();
                ctl.writer.destroy().await;
                let _ = self.shared.events.send(SwarmEvent::Disconnection {
                    peer_id: record.peer_id,
                    topic: key,
                    closed_at: unix_ms(),
                });
            }
        }
        info!(topic = %key.to_hex(), "topic left");
        Ok(())
    }

    /// Connect to a specific peer outside any joined topic: the direct path
    /// first, then the relay fallback. When both fail, the error carries both
    /// causes.
    pub async fn connect(&self, peer: PeerId) -> Result<Connection, SwarmError> {
        let key = TopicKey::direct(&peer);
        {
            let mut state = self.shared.state.lock().await;
            if state.destroyed {
                return Err(SwarmError::Destroyed);
            }
            if state.attempts.contains(&(peer, key)) {
                return Err(SwarmError::AttemptInProgress {
                    peer: peer.to_hex(),
                });
            }
            // A live record means the caller already holds a connection (or an
            // inbound one is mid-adoption); either way this is recoverable,
            // not a state-machine violation.
            if let Some(record) = state.peers.get(&peer, &key) {
                if !record.state.is_terminal() {
                    return Err(match record.state {
                        PeerState::Connected | PeerState::Closing => {
                            SwarmError::AlreadyConnected {
                                peer: peer.to_hex(),
                            }
                        }
                        _ => SwarmError::AttemptInProgress {
                            peer: peer.to_hex(),
                        },
                    });
                }
            }
            self.shared.await_dht_ready().await?;
            state.peers.upsert(peer, key)?;
            state.peers.transition(&peer, &key, PeerState::Connecting)?;
            state.attempts.insert((peer, key));
        }

        match self.shared.attempt_both_paths(peer, key).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                self.shared.fail_attempt(peer, key, &e).await;
                Err(e)
            }
        }
    }

    /// Number of active (non-terminal) peer records.
    pub async fn peer_count(&self) -> usize {
        self.shared.state.lock().await.peers.active_count()
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.shared.state.lock().await.connections.len()
    }

    /// Currently joined topic keys.
    pub async fn topics(&self) -> Vec<TopicKey> {
        self.shared.state.lock().await.registry.topics()
    }

    /// Peer records scoped to a topic.
    pub async fn peers_for_topic(&self, topic: impl Into<Topic>) -> Vec<crate::peer::PeerRecord> {
        match TopicKey::normalize(&topic.into()) {
            Ok(key) => self.shared.state.lock().await.peers.records_for_topic(&key),
            Err(_) => Vec::new(),
        }
    }

    /// Tear the swarm down: every topic, connection, relay link and the DHT
    /// resource. Idempotent; sub-teardown failures are logged, never raised.
    pub async fn destroy(&self) {
        {
            let mut state = self.shared.state.lock().await;
            if state.destroyed {
                return;
            }
            state.destroyed = true;

            if let Some(driver) = state.driver.take() {
                driver.abort();
            }
            for (_, task) in state.discovery_tasks.drain() {
                task.abort();
            }
            let connections: Vec<_> = state.connections.drain().collect();
            for (id, ctl) in connections {
                debug!(connection_id = %id, "closing connection on destroy");
                ctl.pump.abort();
                ctl.writer.destroy().await;
            }
            state.registry.clear().await;
            state.peers.clear();
            state.attempts.clear();
        }

        self.shared.pool.destroy().await;
        // Bounded so a hung collaborator cannot stall the rest of teardown.
        match tokio::time::timeout(TEARDOWN_TIMEOUT, self.shared.dht.destroy()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "dht teardown failed"),
            Err(_) => warn!("dht teardown timed out"),
        }
        info!(peer = %self.shared.local_peer, "swarm destroyed");
    }
}

impl Shared {
    /// Await the DHT readiness handshake once; later calls return
    /// immediately. A failed handshake is retried on the next use.
    async fn await_dht_ready(&self) -> Result<(), SwarmError> {
        self.dht_ready
            .get_or_try_init(|| self.dht.ready())
            .await
            .map(|_| ())
    }

    /// Admit a discovered peer and, when this side wins the initiation
    /// tie-break, start a connection attempt. Per-peer failures stay isolated.
    async fn handle_discovered_peer(self: &Arc<Self>, info: PeerInfo) {
        let peer = info.peer_id;
        let topic = info.topic;
        if peer == self.local_peer {
            return;
        }

        let mut state = self.state.lock().await;
        if state.destroyed || !state.registry.contains(&topic) {
            return;
        }
        let is_new = match state.peers.upsert(peer, topic) {
            Ok((_, is_new)) => is_new,
            Err(e) => {
                warn!(peer = %peer, topic = %topic.to_hex(), error = %e, "peer not admitted");
                let _ = self.events.send(SwarmEvent::Error {
                    peer_id: Some(peer),
                    topic: Some(topic),
                    reason: e.to_string(),
                });
                return;
            }
        };
        if !is_new {
            return;
        }
        let _ = self.events.send(SwarmEvent::PeerDiscovered {
            peer_id: peer,
            topic,
        });

        // Both sides see the discovery; only one dials.
        if !should_initiate(&self.local_peer, &peer) {
            return;
        }
        if state.attempts.contains(&(peer, topic)) {
            return;
        }
        if let Err(e) = state.peers.transition(&peer, &topic, PeerState::Connecting) {
            warn!(peer = %peer, error = %e, "could not start attempt");
            return;
        }
        state.attempts.insert((peer, topic));
        drop(state);

        let shared = self.clone();
        tokio::spawn(async move {
            match shared.attempt_both_paths(peer, topic).await {
                Ok(connection) => {
                    if shared.incoming.send(connection).is_err() {
                        debug!(peer = %peer, "incoming receiver dropped");
                    }
                }
                Err(e) => {
                    warn!(peer = %peer, topic = %topic.to_hex(), error = %e, "connection attempt failed");
                    shared.fail_attempt(peer, topic, &e).await;
                }
            }
        });
    }

    /// Try the direct path, then the relay fallback, and establish whichever
    /// succeeds. The connecting phase is bounded by the configured timeout.
    async fn attempt_both_paths(
        self: &Arc<Self>,
        peer: PeerId,
        topic: TopicKey,
    ) -> Result<Connection, SwarmError> {
        let direct_err = if self.config.direct_transport {
            match tokio::time::timeout(self.config.connection_timeout, self.dht.connect(peer))
                .await
            {
                Ok(Ok(transport)) => {
                    let id = uuid::Uuid::new_v4().to_string();
                    return self
                        .establish(
                            peer,
                            topic,
                            id,
                            TransportKind::Direct,
                            ConnectionWriter::Direct(transport.clone()),
                            EventSource::Duplex(transport),
                        )
                        .await;
                }
                Ok(Err(e)) => e,
                Err(_) => SwarmError::ConnectionTimeout {
                    timeout_ms: self.config.connection_timeout.as_millis() as u64,
                },
            }
        } else {
            SwarmError::Transport("direct transport disabled".to_string())
        };
        debug!(peer = %peer, error = %direct_err, "direct path failed, trying relay");

        let relay_attempt = tokio::time::timeout(
            self.config.connection_timeout,
            self.pool
                .open_connection(self.config.relay_urls(), peer, topic),
        )
        .await;
        match relay_attempt {
            Ok(Ok((id, events, writer))) => {
                self.establish(
                    peer,
                    topic,
                    id,
                    TransportKind::Relay,
                    ConnectionWriter::Relay(writer),
                    EventSource::Channel(events),
                )
                .await
            }
            Ok(Err(relay_err)) => Err(SwarmError::ConnectionFailed {
                direct: Box::new(direct_err),
                relay: Box::new(relay_err),
            }),
            Err(_) => Err(SwarmError::ConnectionFailed {
                direct: Box::new(direct_err),
                relay: Box::new(SwarmError::ConnectionTimeout {
                    timeout_ms: self.config.connection_timeout.as_millis() as u64,
                }),
            }),
        }
    }

    /// Mark a connection established: peer record, live-connection entry,
    /// pump task and the `Connection` event.
    async fn establish(
        self: &Arc<Self>,
        peer: PeerId,
        topic: TopicKey,
        connection_id: String,
        kind: TransportKind,
        writer: ConnectionWriter,
        source: EventSource,
    ) -> Result<Connection, SwarmError> {
        let mut state = self.state.lock().await;
        state.attempts.remove(&(peer, topic));
        if state.destroyed {
            writer.destroy().await;
            return Err(SwarmError::Destroyed);
        }
        // The record can be gone if the topic was left mid-attempt.
        if let Err(e) = state.peers.transition(&peer, &topic, PeerState::Connected) {
            writer.destroy().await;
            return Err(e);
        }
        let connected_at = unix_ms();
        if let Some(record) = state.peers.get_mut(&peer, &topic) {
            record.kind = Some(kind);
            record.connection_id = Some(connection_id.clone());
        }

        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let pump = self.spawn_pump(connection_id.clone(), source, data_tx);
        state.connections.insert(
            connection_id.clone(),
            ConnectionCtl {
                writer: writer.clone(),
                pump,
            },
        );
        drop(state);

        let info = ConnectionInfo {
            connection_id,
            peer_id: peer,
            topic,
            kind,
            connected_at,
        };
        info!(peer = %peer, topic = %topic.to_hex(), kind = ?kind, "connection established");
        let _ = self.events.send(SwarmEvent::Connection(info.clone()));
        Ok(Connection::new(info, writer, data_rx))
    }

    /// Pump one connection's event source until its terminal event.
    fn spawn_pump(
        self: &Arc<Self>,
        connection_id: String,
        mut source: EventSource,
        data_tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> JoinHandle<()> {
        let shared = self.clone();
        tokio::spawn(async move {
            loop {
                match source.next().await {
                    StreamEvent::Data(bytes) => {
                        // Application dropped its handle; keep draining so
                        // close detection still works.
                        let _ = data_tx.send(bytes);
                    }
                    StreamEvent::Closed => {
                        shared.finish_connection(&connection_id, None).await;
                        break;
                    }
                    StreamEvent::Errored(reason) => {
                        shared.finish_connection(&connection_id, Some(reason)).await;
                        break;
                    }
                }
            }
        })
    }

    /// Exactly-once terminal handling: whichever of close, error, leave or
    /// destroy removes the live-connection entry first does the reporting.
    async fn finish_connection(self: &Arc<Self>, connection_id: &str, error: Option<String>) {
        let mut state = self.state.lock().await;
        if state.connections.remove(connection_id).is_none() {
            return;
        }
        let Some((peer, topic)) = state.peers.find_by_connection(connection_id) else {
            return;
        };

        match error {
            None => {
                for next in [PeerState::Closing, PeerState::Closed] {
                    if let Err(e) = state.peers.transition(&peer, &topic, next) {
                        debug!(peer = %peer, error = %e, "close transition skipped");
                        break;
                    }
                }
                info!(peer = %peer, topic = %topic.to_hex(), "connection closed");
                let _ = self.events.send(SwarmEvent::Disconnection {
                    peer_id: peer,
                    topic,
                    closed_at: unix_ms(),
                });
            }
            Some(reason) => {
                if let Err(e) = state.peers.transition(&peer, &topic, PeerState::Errored) {
                    debug!(peer = %peer, error = %e, "error transition skipped");
                }
                warn!(peer = %peer, topic = %topic.to_hex(), %reason, "connection errored");
                let _ = self.events.send(SwarmEvent::Error {
                    peer_id: Some(peer),
                    topic: Some(topic),
                    reason,
                });
            }
        }
        // Terminal records leave the table once reported.
        state.peers.remove(&peer, &topic);
    }

    /// Record a failed attempt: drop the in-flight marker, error the record.
    async fn fail_attempt(self: &Arc<Self>, peer: PeerId, topic: TopicKey, error: &SwarmError) {
        let mut state = self.state.lock().await;
        state.attempts.remove(&(peer, topic));
        if let Err(e) = state.peers.transition(&peer, &topic, PeerState::Errored) {
            debug!(peer = %peer, error = %e, "attempt-failure transition skipped");
        }
        state.peers.remove(&peer, &topic);
        let _ = self.events.send(SwarmEvent::Error {
            peer_id: Some(peer),
            topic: Some(topic),
            reason: error.to_string(),
        });
    }

    /// Adopt an inbound direct connection reported by the DHT session.
    async fn adopt_direct(self: &Arc<Self>, transport: Arc<dyn Duplex>, info: PeerInfo) {
        let id = uuid::Uuid::new_v4().to_string();
        self.adopt(
            info.peer_id,
            info.topic,
            id,
            TransportKind::Direct,
            ConnectionWriter::Direct(transport.clone()),
            EventSource::Duplex(transport),
        )
        .await;
    }

    /// Adopt an inbound relay connection from the fan-out pool.
    async fn adopt_relay(
        self: &Arc<Self>,
        connection_id: String,
        info: PeerInfo,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        writer: crate::relay::RelayWriter,
    ) {
        self.adopt(
            info.peer_id,
            info.topic,
            connection_id,
            TransportKind::Relay,
            ConnectionWriter::Relay(writer),
            EventSource::Channel(events),
        )
        .await;
    }

    /// Shared inbound-adoption path: admit the peer, walk its record to
    /// connected, and deliver the handle through the incoming channel.
    async fn adopt(
        self: &Arc<Self>,
        peer: PeerId,
        topic: TopicKey,
        connection_id: String,
        kind: TransportKind,
        writer: ConnectionWriter,
        source: EventSource,
    ) -> bool {
        {
            let mut state = self.state.lock().await;
            if state.destroyed {
                writer.destroy().await;
                return false;
            }
            // Direct-scoped inbound connections target us by identity and
            // have no joined topic.
            let direct_scope = topic == TopicKey::direct(&self.local_peer);
            if !state.registry.contains(&topic) && !direct_scope {
                debug!(peer = %peer, topic = %topic.to_hex(), "inbound connection for unknown topic rejected");
                writer.destroy().await;
                return false;
            }
            let admitted = match state.peers.upsert(peer, topic) {
                Ok((record, _)) => record.state == PeerState::Discovered,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "inbound peer not admitted");
                    let _ = self.events.send(SwarmEvent::Error {
                        peer_id: Some(peer),
                        topic: Some(topic),
                        reason: e.to_string(),
                    });
                    writer.destroy().await;
                    return false;
                }
            };
            if !admitted {
                // Already connecting or connected on another path.
                debug!(peer = %peer, "duplicate inbound connection rejected");
                writer.destroy().await;
                return false;
            }
            if let Err(e) = state.peers.transition(&peer, &topic, PeerState::Connecting) {
                warn!(peer = %peer, error = %e, "inbound adoption failed");
                writer.destroy().await;
                return false;
            }
        }

        match self
            .establish(peer, topic, connection_id, kind, writer, source)
            .await
        {
            Ok(connection) => {
                if self.incoming.send(connection).is_err() {
                    debug!(peer = %peer, "incoming receiver dropped");
                }
                true
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "inbound adoption failed");
                false
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
