//! In-process relay signaling server
//!
//! Routes envelopes between attached clients: tracks which peer sits behind
//! which session, fans `peer:discovery` out per topic, and forwards data and
//! lifecycle envelopes along established routes. Accepts clients over any
//! duplex transport via `attach`, or over framed TCP via `bind`.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::envelope::{Envelope, EnvelopeKind};
use crate::error::SwarmError;
use crate::identity::PeerId;
use crate::topic::TopicKey;
use crate::transport::{Duplex, FramedTcp, StreamEvent};

/// Sessions a single peer identity may hold at once. Excess registrations
/// are dropped with a warning.
const MAX_SESSIONS_PER_PEER: usize = 5;

struct Session {
    outbound: mpsc::UnboundedSender<Envelope>,
    transport: Arc<dyn Duplex>,
    peer: Option<PeerId>,
    topics: HashSet<TopicKey>,
}

struct ServerInner {
    next_session: AtomicU64,
    sessions: RwLock<HashMap<u64, Session>>,
    /// Peer identity -> sessions registered under it.
    peers: RwLock<HashMap<PeerId, HashSet<u64>>>,
    /// Topic -> member sessions.
    topics: RwLock<HashMap<TopicKey, HashSet<u64>>>,
    /// Logical connection id -> (origin session, target session).
    routes: RwLock<HashMap<String, (u64, u64)>>,
    tasks: RwLock<Vec<JoinHandle<()>>>,
}

/// Snapshot of server occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub sessions: usize,
    pub peers: usize,
    pub topics: usize,
    pub routes: usize,
}

/// The relay signaling server.
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<ServerInner>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ServerInner {
                next_session: AtomicU64::new(1),
                sessions: RwLock::new(HashMap::new()),
                peers: RwLock::new(HashMap::new()),
                topics: RwLock::new(HashMap::new()),
                routes: RwLock::new(HashMap::new()),
                tasks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            sessions: self.inner.sessions.read().len(),
            peers: self.inner.peers.read().len(),
            topics: self.inner.topics.read().len(),
            routes: self.inner.routes.read().len(),
        }
    }

    /// Serve clients from a duplex transport. Used directly for in-process
    /// links; `bind` feeds accepted TCP streams through here.
    pub fn attach(&self, transport: Arc<dyn Duplex>) {
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        self.inner.sessions.write().insert(
            id,
            Session {
                outbound,
                transport: transport.clone(),
                peer: None,
                topics: HashSet::new(),
            },
        );
        debug!(session = id, "relay session attached");

        let writer_transport = transport.clone();
        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let bytes = match envelope.to_bytes() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(session = id, error = %e, "failed to encode envelope");
                        continue;
                    }
                };
                if writer_transport.write(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let server = self.clone();
        let reader = tokio::spawn(async move {
            loop {
                match transport.next_event().await {
                    StreamEvent::Data(bytes) => server.handle_frame(id, &bytes),
                    StreamEvent::Closed => {
                        server.remove_session(id).await;
                        break;
                    }
                    StreamEvent::Errored(reason) => {
                        debug!(session = id, %reason, "relay session errored");
                        server.remove_session(id).await;
                        break;
                    }
                }
            }
        });

        let mut tasks = self.inner.tasks.write();
        tasks.push(writer);
        tasks.push(reader);
    }

    /// Listen on a TCP address, attaching every accepted stream.
    pub async fn bind(&self, addr: &str) -> Result<std::net::SocketAddr, SwarmError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SwarmError::Transport(format!("bind {addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| SwarmError::Transport(e.to_string()))?;
        info!(%local, "relay server listening");

        let server = self.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!(%remote, "relay client accepted");
                        server.attach(FramedTcp::from_stream(stream));
                    }
                    Err(e) => {
                        warn!(error = %e, "relay accept failed");
                        break;
                    }
                }
            }
        });
        self.inner.tasks.write().push(accept);
        Ok(local)
    }

    /// Stop serving and tear down every session.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.inner.tasks.write().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        let sessions: Vec<_> = self.inner.sessions.write().drain().collect();
        self.inner.peers.write().clear();
        self.inner.topics.write().clear();
        self.inner.routes.write().clear();
        for (id, session) in sessions {
            debug!(session = id, "closing relay session on shutdown");
            session.transport.destroy().await;
        }
    }

    fn handle_frame(&self, session: u64, bytes: &[u8]) {
        let envelope = match Envelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(session, error = %e, "dropping malformed envelope");
                return;
            }
        };
        match envelope.kind {
            EnvelopeKind::TopicJoin => self.handle_join(session, &envelope),
            EnvelopeKind::TopicLeave => self.handle_leave(session, &envelope),
            EnvelopeKind::ConnectionOpen => self.handle_open(session, &envelope),
            EnvelopeKind::ConnectionClose => self.handle_close(session, &envelope),
            EnvelopeKind::Data => self.forward(session, envelope),
            EnvelopeKind::PeerDiscovery => {
                debug!(session, "ignoring client-sent peer:discovery");
            }
        }
    }

    fn handle_join(&self, session: u64, envelope: &Envelope) {
        let (Some(topic), Some(peer)) = (envelope.topic_key(), envelope.peer_id()) else {
            warn!(session, "malformed topic:join dropped");
            return;
        };

        {
            let mut peers = self.inner.peers.write();
            let sessions = peers.entry(peer).or_default();
            if !sessions.contains(&session) && sessions.len() >= MAX_SESSIONS_PER_PEER {
                warn!(session, peer = %peer, "session limit reached, join dropped");
                return;
            }
            sessions.insert(session);
        }

        let members: Vec<u64> = {
            let mut topics = self.inner.topics.write();
            let members = topics.entry(topic).or_default();
            if !members.insert(session) {
                return;
            }
            members.iter().copied().filter(|m| *m != session).collect()
        };
        debug!(session, peer = %peer, topic = %topic.to_hex(), "topic joined");

        let sessions = self.inner.sessions.read();
        if let Some(joining) = sessions.get(&session) {
            // Announce existing members to the new client and vice versa.
            for member in members {
                let Some(other) = sessions.get(&member) else {
                    continue;
                };
                if let Some(other_peer) = other.peer {
                    let _ = joining
                        .outbound
                        .send(Envelope::peer_discovery(&other_peer, &topic));
                }
                let _ = other.outbound.send(Envelope::peer_discovery(&peer, &topic));
            }
        }
        drop(sessions);

        let mut sessions = self.inner.sessions.write();
        if let Some(record) = sessions.get_mut(&session) {
            record.peer = Some(peer);
            record.topics.insert(topic);
        }
    }

    fn handle_leave(&self, session: u64, envelope: &Envelope) {
        let Some(topic) = envelope.topic_key() else {
            warn!(session, "malformed topic:leave dropped");
            return;
        };
        let mut topics = self.inner.topics.write();
        if let Some(members) = topics.get_mut(&topic) {
            members.remove(&session);
            if members.is_empty() {
                topics.remove(&topic);
            }
        }
        drop(topics);
        if let Some(record) = self.inner.sessions.write().get_mut(&session) {
            record.topics.remove(&topic);
        }
    }

    fn handle_open(&self, session: u64, envelope: &Envelope) {
        let (Some(id), Some(target_peer), Some(topic)) = (
            envelope.connection_id.clone(),
            envelope.peer_id(),
            envelope.topic_key(),
        ) else {
            warn!(session, "malformed connection:open dropped");
            return;
        };

        let origin_peer = {
            let sessions = self.inner.sessions.read();
            sessions.get(&session).and_then(|s| s.peer)
        };
        let Some(origin_peer) = origin_peer else {
            warn!(session, "connection:open from unregistered session dropped");
            return;
        };

        // Prefer a target session that joined the topic.
        let target = {
            let peers = self.inner.peers.read();
            let sessions = self.inner.sessions.read();
            peers.get(&target_peer).and_then(|candidates| {
                candidates
                    .iter()
                    .filter(|c| **c != session)
                    .find(|c| {
                        sessions
                            .get(c)
                            .map(|s| s.topics.contains(&topic))
                            .unwrap_or(false)
                    })
                    .or_else(|| candidates.iter().find(|c| **c != session))
                    .copied()
            })
        };
        let Some(target) = target else {
            debug!(session, peer = %target_peer, "open target unavailable");
            let sessions = self.inner.sessions.read();
            if let Some(origin) = sessions.get(&session) {
                let _ = origin.outbound.send(Envelope::connection_close(&id));
            }
            return;
        };

        self.inner.routes.write().insert(id.clone(), (session, target));
        let sessions = self.inner.sessions.read();
        if let Some(target_session) = sessions.get(&target) {
            // Rewrite the peer field to the origin so the receiver knows who
            // is calling.
            let _ = target_session
                .outbound
                .send(Envelope::connection_open(&id, &origin_peer, &topic));
        }
    }

    fn handle_close(&self, session: u64, envelope: &Envelope) {
        let Some(id) = envelope.connection_id.clone() else {
            warn!(session, "malformed connection:close dropped");
            return;
        };
        let route = self.inner.routes.write().remove(&id);
        let Some((origin, target)) = route else {
            debug!(session, connection_id = %id, "close for unknown route dropped");
            return;
        };
        let counterpart = if origin == session { target } else { origin };
        let sessions = self.inner.sessions.read();
        if let Some(other) = sessions.get(&counterpart) {
            let _ = other.outbound.send(Envelope::connection_close(&id));
        }
    }

    fn forward(&self, session: u64, envelope: Envelope) {
        let Some(id) = envelope.connection_id.as_deref() else {
            warn!(session, "data envelope without connection id dropped");
            return;
        };
        let route = {
            let routes = self.inner.routes.read();
            routes.get(id).copied()
        };
        let Some((origin, target)) = route else {
            warn!(session, connection_id = id, "data for unknown route dropped");
            return;
        };
        let counterpart = if origin == session { target } else { origin };
        let sessions = self.inner.sessions.read();
        if let Some(other) = sessions.get(&counterpart) {
            let _ = other.outbound.send(envelope);
        }
    }

    /// Full cleanup for a disconnected session: membership, registration, and
    /// a `connection:close` to the counterpart of every route it carried.
    async fn remove_session(&self, session: u64) {
        let record = self.inner.sessions.write().remove(&session);
        let Some(record) = record else {
            return;
        };
        debug!(session, "relay session removed");

        if let Some(peer) = record.peer {
            let mut peers = self.inner.peers.write();
            if let Some(sessions) = peers.get_mut(&peer) {
                sessions.remove(&session);
                if sessions.is_empty() {
                    peers.remove(&peer);
                }
            }
        }
        {
            let mut topics = self.inner.topics.write();
            for topic in &record.topics {
                if let Some(members) = topics.get_mut(topic) {
                    members.remove(&session);
                    if members.is_empty() {
                        topics.remove(topic);
                    }
                }
            }
        }

        let orphaned: Vec<(String, u64)> = {
            let mut routes = self.inner.routes.write();
            let ids: Vec<String> = routes
                .iter()
                .filter(|(_, (o, t))| *o == session || *t == session)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    routes.remove(&id).map(|(o, t)| {
                        let counterpart = if o == session { t } else { o };
                        (id, counterpart)
                    })
                })
                .collect()
        };
        {
            let sessions = self.inner.sessions.read();
            for (id, counterpart) in orphaned {
                if let Some(other) = sessions.get(&counterpart) {
                    let _ = other.outbound.send(Envelope::connection_close(&id));
                }
            }
        }

        record.transport.destroy().await;
    }
}

// ============================================================================
// TESTS
// ============================================================================
