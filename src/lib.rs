//! webswarm — peer discovery and connection lifecycle over an external DHT
//!
//! A [`Swarm`] joins topics on a DHT service, tracks discovered peers through
//! an explicit connection state machine, and establishes connections over a
//! direct transport with a relay fallback for constrained or unreachable
//! runtimes. Lifecycle changes surface as typed [`SwarmEvent`]s; established
//! connections arrive as [`Connection`] handles.
//!
//! ```no_run
//! use std::sync::Arc;
//! use webswarm::{JoinOpts, Swarm, SwarmConfig};
//! # async fn run(dht: Arc<dyn webswarm::Dht>) -> Result<(), webswarm::SwarmError> {
//! let (swarm, mut incoming) = Swarm::new(SwarmConfig::default(), dht);
//! let discovery = swarm.join("my-app-room", JoinOpts::default()).await?;
//!
//! while let Some(mut conn) = incoming.recv().await {
//!     conn.write(b"hello").await?;
//!     if let Some(reply) = conn.recv().await {
//!         println!("got {} bytes from {}", reply.len(), conn.peer_id());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dht;
pub mod error;
pub mod events;
pub mod identity;
pub mod peer;
pub mod relay;
pub mod topic;
pub mod transport;

mod swarm;

pub use config::{SwarmConfig, DEFAULT_BOOTSTRAP, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_MAX_PEERS};
pub use connection::Connection;
pub use dht::{Dht, DhtDiscovery, DiscoveryEvent, JoinOpts, PeerInfo};
pub use error::SwarmError;
pub use events::{ConnectionInfo, SwarmEvent};
pub use identity::{KeyPair, PeerId};
pub use peer::{PeerRecord, PeerState, TransportKind};
pub use relay::{RelayServer, ServerStats};
pub use swarm::Swarm;
pub use topic::{Discovery, FlushOutcome, Topic, TopicKey};
pub use transport::{Duplex, RelayDialer, StreamEvent};
