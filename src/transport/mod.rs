//! Transport seam — opaque duplex byte-stream capabilities
//!
//! The swarm never talks to sockets directly; it drives anything that can
//! write bytes and emit data/close/error events. Raw TCP with length-prefixed
//! frames and an in-memory pair are provided; WebSocket or WebRTC transports
//! plug in behind the same trait.

pub mod framed;
pub mod memory;

use async_trait::async_trait;

use crate::error::SwarmError;

pub use framed::{FramedTcp, TcpRelayDialer};
pub use memory::{memory_pair, MemoryDuplex};

/// One event on a duplex stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Bytes arrived.
    Data(Vec<u8>),
    /// The stream closed cleanly. Terminal.
    Closed,
    /// The stream failed. Terminal.
    Errored(String),
}

/// An opaque duplex byte-stream capability.
///
/// After a terminal event, `next_event` keeps returning `Closed` and `write`
/// fails; callers stop pumping on the first terminal event.
#[async_trait]
pub trait Duplex: Send + Sync {
    /// Write one chunk of bytes to the remote side.
    async fn write(&self, bytes: &[u8]) -> Result<(), SwarmError>;

    /// Wait for the next stream event. Single-consumer.
    async fn next_event(&self) -> StreamEvent;

    /// Tear the stream down. Idempotent.
    async fn destroy(&self);
}

/// Dials relay transports by URL. The seam where WebSocket transports would
/// plug in on constrained runtimes.
#[async_trait]
pub trait RelayDialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<std::sync::Arc<dyn Duplex>, SwarmError>;
}
