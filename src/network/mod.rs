//! P2P networking module
//!
//! Provides the peer switch and everything it runs on.
//!
//! # Features
//! - TCP listener and dialer with bounded handshakes
//! - Authenticated node identity exchange
//! - Channel-multiplexed connections with priority send queues
//! - Reactor registry and message dispatch
//! - Duplicate, self-connection and ban filtering
//! - Persistent ban table and address book

pub mod addrbook;
pub mod ban;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dialing;
pub mod listener;
pub mod message;
pub mod netaddress;
pub mod node_info;
pub mod peer;
pub mod peer_set;
pub mod ping;
pub mod reactor;
pub mod switch;

#[cfg(test)]
pub mod testing;

pub use addrbook::{AddrBook, AddrBookError, AddrEntry, AddrManager};
pub use ban::{BanError, BanTable, BANNED_PEER_KEY};
pub use codec::FrameCodec;
pub use config::{MConnConfig, P2pConfig, PeerConfig};
pub use connection::{ConnectionError, MConnection};
pub use dialing::{DialGuard, DialingRegistry};
pub use listener::{DefaultListener, InboundConn, Listener};
pub use message::{Frame, MAGIC};
pub use netaddress::{NetAddress, NetAddressError};
pub use node_info::{NodeInfo, NodeInfoError, PeerId};
pub use peer::{Peer, PeerConn, PeerError, PeerFailure};
pub use peer_set::PeerSet;
pub use ping::{PingReactor, PING_CHANNEL};
pub use reactor::{ChannelDescriptor, Reactor, ReactorError, ReactorRegistry};
pub use switch::{PeerCounts, Switch, SwitchError, INBOUND_ADMISSION_MULTIPLIER};
