//! Node identity and capability descriptor
//!
//! [`NodeInfo`] is exchanged during the handshake. Two nodes may only talk
//! if [`NodeInfo::compatible_with`] succeeds on both sides.

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

use crate::crypto::{node_id_from_public_key, public_key_from_hex};
use crate::network::netaddress::{NetAddress, NetAddressError};

/// NodeInfo validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeInfoError {
    #[error("Invalid version string: {0}")]
    InvalidVersion(String),
    #[error("Peer is on a different major version: {ours} vs {theirs}")]
    MajorVersionMismatch { ours: String, theirs: String },
    #[error("Peer is on a different minor version: {ours} vs {theirs}")]
    MinorVersionMismatch { ours: String, theirs: String },
    #[error("Peer is on a different network: {ours} vs {theirs}")]
    NetworkMismatch { ours: String, theirs: String },
    #[error("Peer has no common channels")]
    NoCommonChannels,
    #[error("Invalid public key in node info")]
    InvalidPubKey,
}

/// Stable peer identity derived from the public key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(node_id_from_public_key(public_key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity and capabilities of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Hex-encoded compressed secp256k1 public key
    pub pub_key: String,
    pub moniker: String,
    /// Network name, peers on other networks are rejected
    pub network: String,
    /// Semantic version `major.minor.patch`
    pub version: String,
    /// Address the peer connected from, as seen by us
    pub remote_addr: String,
    /// Address the node accepts connections on
    pub listen_addr: String,
    /// Channel ids the node serves
    pub channels: Vec<u8>,
    pub other: Vec<String>,
}

impl NodeInfo {
    /// Create a descriptor running this crate's version
    pub fn new(moniker: &str, network: &str, listen_addr: &str) -> Self {
        Self {
            pub_key: String::new(),
            moniker: moniker.to_string(),
            network: network.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            remote_addr: String::new(),
            listen_addr: listen_addr.to_string(),
            channels: Vec::new(),
            other: Vec::new(),
        }
    }

    /// Parse the advertised public key
    pub fn public_key(&self) -> Result<PublicKey, NodeInfoError> {
        public_key_from_hex(&self.pub_key).map_err(|_| NodeInfoError::InvalidPubKey)
    }

    /// Identity of the node that owns this descriptor
    pub fn id(&self) -> Result<PeerId, NodeInfoError> {
        self.public_key().map(|key| PeerId::from_public_key(&key))
    }

    /// Check that a peer's descriptor is compatible with ours
    pub fn compatible_with(&self, other: &NodeInfo) -> Result<(), NodeInfoError> {
        let (our_major, our_minor, _) = split_version(&self.version)?;
        let (their_major, their_minor, _) = split_version(&other.version)?;

        if our_major != their_major {
            return Err(NodeInfoError::MajorVersionMismatch {
                ours: self.version.clone(),
                theirs: other.version.clone(),
            });
        }

        if our_minor != their_minor {
            return Err(NodeInfoError::MinorVersionMismatch {
                ours: self.version.clone(),
                theirs: other.version.clone(),
            });
        }

        if self.network != other.network {
            return Err(NodeInfoError::NetworkMismatch {
                ours: self.network.clone(),
                theirs: other.network.clone(),
            });
        }

        // Nodes that declare no channels accept any peer
        if self.channels.is_empty() || other.channels.is_empty() {
            return Ok(());
        }

        let ours: HashSet<u8> = self.channels.iter().copied().collect();
        if other.channels.iter().any(|ch| ours.contains(ch)) {
            Ok(())
        } else {
            Err(NodeInfoError::NoCommonChannels)
        }
    }

    /// Parsed listen address
    pub fn listen_address(&self) -> Result<NetAddress, NetAddressError> {
        self.listen_addr.parse()
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NodeInfo{{moniker: {}, network: {}, version: {}, listen: {}}}",
            self.moniker, self.network, self.version, self.listen_addr
        )
    }
}

fn split_version(version: &str) -> Result<(u64, u64, u64), NodeInfoError> {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 3 {
        return Err(NodeInfoError::InvalidVersion(version.to_string()));
    }

    let parse = |s: &str| {
        s.parse::<u64>()
            .map_err(|_| NodeInfoError::InvalidVersion(version.to_string()))
    };
    Ok((parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
}
