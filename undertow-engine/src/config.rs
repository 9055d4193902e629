use std::time::Duration;

/// Tunables for one torrent engine instance. The defaults mirror common
/// client behavior; everything here is per-torrent, there is no global
/// engine state.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard cap on simultaneous peer connections.
    pub max_peers: usize,
    /// When connected peers drop below this, new candidates are pulled
    /// from the discovery stream.
    pub target_peers: usize,
    /// Maximum outstanding block requests per peer.
    pub pipeline_depth: usize,
    /// Number of regular unchoke slots.
    pub upload_slots: usize,
    /// Cadence of the choke recomputation.
    pub choke_interval: Duration,
    /// The optimistic slot rotates every this many choke rounds.
    pub optimistic_rounds: u32,
    /// Covers TCP connect plus the handshake exchange.
    pub handshake_timeout: Duration,
    /// Round-trip budget for one block request before it is reassigned.
    pub request_timeout: Duration,
    /// Request timeouts tolerated per peer before disconnecting it.
    pub request_strike_limit: u32,
    /// Interval between outbound keep-alives on an idle link.
    pub keepalive_interval: Duration,
    /// Close the connection when nothing arrives for this long.
    pub inactivity_timeout: Duration,
    /// Endgame starts when unverified pieces drop below
    /// max(connected peers, this floor).
    pub endgame_floor: usize,
    /// Hash failures attributed to a peer before it is banned.
    pub ban_threshold: u32,
    /// Cadence of the swarm maintenance tick (pruning, candidate pulls).
    pub tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_peers: 50,
            target_peers: 30,
            pipeline_depth: 16,
            upload_slots: 4,
            choke_interval: Duration::from_secs(10),
            optimistic_rounds: 3,
            handshake_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
            request_strike_limit: 3,
            keepalive_interval: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(120),
            endgame_floor: 8,
            ban_threshold: 3,
            tick_interval: Duration::from_secs(1),
        }
    }
}
