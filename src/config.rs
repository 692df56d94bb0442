//! Swarm instance configuration

use crate::identity::KeyPair;
use std::time::Duration;

/// Default relay bootstrap list, used when no explicit relay servers are set.
pub const DEFAULT_BOOTSTRAP: &[&str] = &[
    "wss://relay1.hyperswarm.org",
    "wss://relay2.hyperswarm.org",
];

/// Default cap on active peers per instance.
pub const DEFAULT_MAX_PEERS: usize = 24;

/// Default bound on the connecting phase of an attempt.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for one swarm instance.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Relay bootstrap URLs, used for the relay fallback when `relay_servers` is empty.
    pub bootstrap: Vec<String>,
    /// Explicit relay servers, preferred over the bootstrap list when non-empty.
    pub relay_servers: Vec<String>,
    /// Maximum number of active peer records across all topics.
    pub max_peers: usize,
    /// Bound on the connecting phase of each connection attempt.
    pub connection_timeout: Duration,
    /// Whether to announce the local address to the DHT session.
    pub announce_local_address: bool,
    /// Whether this runtime can open direct transport connections.
    ///
    /// Constrained runtimes (no raw socket access) set this to `false` and
    /// establish every connection over the relay fan-out instead.
    pub direct_transport: bool,
    /// Key pair identifying this instance.
    pub keypair: KeyPair,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            bootstrap: DEFAULT_BOOTSTRAP.iter().map(|s| s.to_string()).collect(),
            relay_servers: Vec::new(),
            max_peers: DEFAULT_MAX_PEERS,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            announce_local_address: false,
            direct_transport: true,
            keypair: KeyPair::generate(),
        }
    }
}

impl SwarmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_relay_servers(mut self, servers: Vec<String>) -> Self {
        self.relay_servers = servers;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: Vec<String>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_keypair(mut self, keypair: KeyPair) -> Self {
        self.keypair = keypair;
        self
    }

    pub fn with_direct_transport(mut self, direct: bool) -> Self {
        self.direct_transport = direct;
        self
    }

    pub fn with_announce_local_address(mut self, announce: bool) -> Self {
        self.announce_local_address = announce;
        self
    }

    /// The relay URLs to use for the fallback path.
    pub fn relay_urls(&self) -> &[String] {
        if self.relay_servers.is_empty() {
            &self.bootstrap
        } else {
            &self.relay_servers
        }
    }
}
