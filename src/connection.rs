//! Logical connection plumbing shared by the direct and relay paths
//!
//! A logical connection is a write half plus an event source. Direct
//! connections own a duplex transport for both; relay connections write
//! through the fan-out pool and receive demultiplexed events over a channel.
//! The swarm pumps each event source exactly once, so close and error
//! reporting stays exactly-once per connection.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::SwarmError;
use crate::events::ConnectionInfo;
use crate::identity::PeerId;
use crate::relay::RelayWriter;
use crate::topic::TopicKey;
use crate::transport::{Duplex, StreamEvent};

/// Which side of a mutually discovered pair dials. Both sides discover each
/// other; only the lexicographically smaller peer id initiates, so the pair
/// ends up with one connection instead of two.
pub fn should_initiate(local: &PeerId, remote: &PeerId) -> bool {
    local < remote
}

/// Write half of one logical connection.
#[derive(Clone)]
pub enum ConnectionWriter {
    Direct(Arc<dyn Duplex>),
    Relay(RelayWriter),
}

impl ConnectionWriter {
    pub async fn write(&self, bytes: &[u8]) -> Result<(), SwarmError> {
        match self {
            ConnectionWriter::Direct(transport) => transport.write(bytes).await,
            ConnectionWriter::Relay(writer) => writer.write(bytes),
        }
    }

    /// Tear down the underlying stream. The close surfaces back through the
    /// connection's event source, which drives the lifecycle bookkeeping.
    pub async fn destroy(&self) {
        match self {
            ConnectionWriter::Direct(transport) => transport.destroy().await,
            ConnectionWriter::Relay(writer) => writer.destroy().await,
        }
    }
}

/// Read half of one logical connection. Single-consumer.
pub enum EventSource {
    Duplex(Arc<dyn Duplex>),
    Channel(mpsc::UnboundedReceiver<StreamEvent>),
}

impl EventSource {
    /// Next stream event; a vanished channel counts as a clean close.
    pub async fn next(&mut self) -> StreamEvent {
        match self {
            EventSource::Duplex(transport) => transport.next_event().await,
            EventSource::Channel(rx) => rx.recv().await.unwrap_or(StreamEvent::Closed),
        }
    }
}

/// Supervisor-side record of one live connection.
pub(crate) struct ConnectionCtl {
    pub writer: ConnectionWriter,
    pub pump: JoinHandle<()>,
}

/// An established connection as handed to the application.
///
/// Reads are exclusive to this handle; writes and destroy go through the
/// shared write half. Dropping the handle does not close the connection.
pub struct Connection {
    info: ConnectionInfo,
    writer: ConnectionWriter,
    data: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Connection {
    pub(crate) fn new(
        info: ConnectionInfo,
        writer: ConnectionWriter,
        data: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self { info, writer, data }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn peer_id(&self) -> PeerId {
        self.info.peer_id
    }

    pub fn topic(&self) -> TopicKey {
        self.info.topic
    }

    pub fn connection_id(&self) -> &str {
        &self.info.connection_id
    }

    /// Send one message to the remote peer.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), SwarmError> {
        self.writer.write(bytes).await
    }

    /// Receive the next message. `None` once the connection has closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.data.recv().await
    }

    /// Close the connection. Lifecycle events follow through the swarm.
    pub async fn destroy(&self) {
        self.writer.destroy().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.info)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;
    use crate::peer::TransportKind;
    use crate::topic::Topic;
    use crate::transport::memory_pair;

    #[test]
    fn test_initiation_tie_break_is_antisymmetric() {
        let a = KeyPair::generate().peer_id();
        let b = KeyPair::generate().peer_id();
        assert_ne!(should_initiate(&a, &b), should_initiate(&b, &a));
        assert!(!should_initiate(&a, &a));
    }

    #[tokio::test]
    async fn test_direct_writer_reaches_remote_end() {
        let (local, remote) = memory_pair();
        let writer = ConnectionWriter::Direct(local);
        writer.write(b"hello").await.unwrap();
        assert_eq!(
            remote.next_event().await,
            StreamEvent::Data(b"hello".to_vec())
        );
    }

    #[tokio::test]
    async fn test_event_source_channel_closes_when_sender_drops() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut source = EventSource::Channel(rx);
        tx.send(StreamEvent::Data(vec![1])).unwrap();
        drop(tx);
        assert_eq!(source.next().await, StreamEvent::Data(vec![1]));
        assert_eq!(source.next().await, StreamEvent::Closed);
    }

    #[tokio::test]
    async fn test_connection_reads_from_its_data_channel() {
        let (local, _remote) = memory_pair();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let info = ConnectionInfo {
            connection_id: "c1".to_string(),
            peer_id: KeyPair::generate().peer_id(),
            topic: TopicKey::normalize(&Topic::from("conn-tests")).unwrap(),
            kind: TransportKind::Direct,
            connected_at: 0,
        };
        let mut conn = Connection::new(
            info,
            ConnectionWriter::Direct(local),
            data_rx,
        );

        data_tx.send(b"inbound".to_vec()).unwrap();
        drop(data_tx);
        assert_eq!(conn.recv().await, Some(b"inbound".to_vec()));
        assert_eq!(conn.recv().await, None);
    }
}
