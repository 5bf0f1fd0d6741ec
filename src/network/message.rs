//! Wire frames exchanged between peers
//!
//! Every frame is JSON encoded and wrapped by [`FrameCodec`](super::codec::FrameCodec).

use serde::{Deserialize, Serialize};

use crate::network::node_info::NodeInfo;

/// Magic bytes for frame delimiting
pub const MAGIC: [u8; 4] = [0x53, 0x57, 0x43, 0x48]; // "SWCH"

/// Frame header size: magic (4) + length (4)
pub const HEADER_SIZE: usize = 8;

/// Upper bound on the JSON around a hex payload in a `Packet` body
pub const PACKET_OVERHEAD: usize = 64;

/// Largest payload whose `Packet` frame fits in `max_frame_size`
pub fn max_payload_size(max_frame_size: usize) -> usize {
    max_frame_size.saturating_sub(PACKET_OVERHEAD) / 2
}

/// Frames sent over a peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First handshake message: our identity and a challenge for the peer
    Hello(Hello),

    /// Second handshake message: signature over the peer's challenge
    Proof(Proof),

    /// Application payload on a logical channel, hex on the wire
    Packet {
        channel_id: u8,
        #[serde(with = "hex")]
        payload: Vec<u8>,
    },

    /// Keepalive ping
    Ping,

    /// Keepalive response
    Pong,
}

/// Handshake greeting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub node_info: NodeInfo,
    /// Hex-encoded 32 byte challenge
    pub nonce: String,
}

/// Handshake proof of key ownership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Hex-encoded compact ECDSA signature
    pub signature: String,
}

impl Frame {
    /// Serialize frame to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize frame from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Get frame type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "Hello",
            Frame::Proof(_) => "Proof",
            Frame::Packet { .. } => "Packet",
            Frame::Ping => "Ping",
            Frame::Pong => "Pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_serialization() {
        let frame = Frame::Packet {
            channel_id: 0x20,
            payload: b"hello".to_vec(),
        };
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), frame);
        assert_eq!(frame.type_name(), "Packet");
    }

    #[test]
    fn test_largest_payload_fits_frame() {
        let max_frame_size = 4096;
        let frame = Frame::Packet {
            channel_id: 0xff,
            payload: vec![0xab; max_payload_size(max_frame_size)],
        };
        let bytes = frame.to_bytes().unwrap();
        assert!(bytes.len() <= max_frame_size);
        assert!(String::from_utf8(bytes).unwrap().contains("abab"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Frame::from_bytes(b"{\"Nope\":1}").is_err());
    }
}
