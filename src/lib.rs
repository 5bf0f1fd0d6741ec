//! Peer-switch: the connection core of a peer-to-peer network node
//!
//! This crate provides:
//! - An authenticated TCP handshake keyed by secp256k1 node identities
//! - Channel-multiplexed peer connections with priority send queues
//! - A switch that admits, filters, tracks and tears down peers
//! - Pluggable reactors that own channels and receive peer events
//! - A persistent ban table and JSON address book
//!
//! # Example
//!
//! ```rust,no_run
//! use peer_switch::crypto::KeyPair;
//! use peer_switch::network::{AddrManager, NodeInfo, P2pConfig, PingReactor, Switch};
//! use peer_switch::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = P2pConfig::default();
//! let node_info = NodeInfo::new("node", "mainnet", &config.listen_address);
//! let mut switch = Switch::new(
//!     config,
//!     node_info,
//!     KeyPair::generate(),
//!     Arc::new(AddrManager::new()),
//!     Arc::new(MemoryStore::new()),
//! )?;
//! switch.add_reactor("ping", Arc::new(PingReactor::new()));
//!
//! let switch = Arc::new(switch);
//! switch.start()?;
//! let peer = switch.dial_peer_with_address(&"10.0.0.2:46656".parse()?).await?;
//! println!("Connected to {}", peer);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod crypto;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use crypto::KeyPair;
pub use network::{
    NetAddress, NodeInfo, P2pConfig, Peer, PeerId, Reactor, Switch, SwitchError,
};
pub use storage::{FileStore, KvStore, MemoryStore};
