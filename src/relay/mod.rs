//! Relay transport path: signaling envelope, client-side fan-out, and the
//! in-process signaling server.

pub mod envelope;
pub mod fanout;
pub mod server;

pub use envelope::{Envelope, EnvelopeKind};
pub use fanout::{PoolEvent, RelayPool, RelayWriter};
pub use server::{RelayServer, ServerStats};
