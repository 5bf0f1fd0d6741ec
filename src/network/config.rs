//! P2P configuration
//!
//! [`P2pConfig`] carries every tunable the switch reads. Per-connection
//! settings are derived from it as [`PeerConfig`] and [`MConnConfig`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default listen address
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:46656";

/// Default maximum number of peers
pub const DEFAULT_MAX_NUM_PEERS: usize = 50;

/// Default handshake timeout in seconds
pub const DEFAULT_HANDSHAKE_TIMEOUT: u64 = 30;

/// Default dial timeout in seconds
pub const DEFAULT_DIAL_TIMEOUT: u64 = 3;

/// Default keepalive ping interval in seconds
pub const DEFAULT_PING_INTERVAL: u64 = 60;

/// Default pong timeout in seconds
pub const DEFAULT_PONG_TIMEOUT: u64 = 45;

/// Default maximum frame size (1 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default ban duration in seconds (one hour)
pub const DEFAULT_BAN_DURATION: u64 = 60 * 60;

/// Smallest keepalive ping interval in seconds; a zero interval cannot tick
pub const MIN_PING_INTERVAL: u64 = 1;

/// P2P switch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Address the default listener binds to
    pub listen_address: String,
    /// Address advertised to peers instead of the listen address
    pub external_address: Option<String>,
    /// Maximum number of connected peers
    pub max_num_peers: usize,
    /// Handshake timeout in seconds
    pub handshake_timeout: u64,
    /// Outbound dial timeout in seconds
    pub dial_timeout: u64,
    /// Keepalive ping interval in seconds
    pub ping_interval: u64,
    /// Seconds of read silence tolerated after a ping interval elapses
    pub pong_timeout: u64,
    /// Largest accepted wire frame in bytes
    pub max_frame_size: usize,
    /// Ban duration in seconds
    pub ban_duration: u64,
    /// Peers dialed at startup
    pub seeds: Vec<String>,
    /// Address book file name, relative to the data directory
    pub addr_book_file: String,
    /// Key-value store file name, relative to the data directory
    pub store_file: String,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            external_address: None,
            max_num_peers: DEFAULT_MAX_NUM_PEERS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            ban_duration: DEFAULT_BAN_DURATION,
            seeds: Vec::new(),
            addr_book_file: "addrbook.json".to_string(),
            store_file: "p2p_store.json".to_string(),
        }
    }
}

impl P2pConfig {
    /// Address peers should use to reach us
    pub fn advertised_address(&self) -> &str {
        self.external_address
            .as_deref()
            .unwrap_or(&self.listen_address)
    }

    /// Ban duration as a [`Duration`]
    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration)
    }
}

/// Settings for a multiplexed connection
#[derive(Debug, Clone)]
pub struct MConnConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub max_frame_size: usize,
}

impl MConnConfig {
    /// Longest silence on the read side before the connection is considered dead
    pub fn read_timeout(&self) -> Duration {
        self.ping_interval + self.pong_timeout
    }
}

impl Default for MConnConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL),
            pong_timeout: Duration::from_secs(DEFAULT_PONG_TIMEOUT),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Settings applied to every peer connection
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
    pub mconfig: MConnConfig,
}

impl PeerConfig {
    pub fn from_p2p(config: &P2pConfig) -> Self {
        Self {
            handshake_timeout: Duration::from_secs(config.handshake_timeout),
            dial_timeout: Duration::from_secs(config.dial_timeout),
            mconfig: MConnConfig {
                ping_interval: Duration::from_secs(config.ping_interval.max(MIN_PING_INTERVAL)),
                pong_timeout: Duration::from_secs(config.pong_timeout),
                max_frame_size: config.max_frame_size,
            },
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self::from_p2p(&P2pConfig::default())
    }
}
