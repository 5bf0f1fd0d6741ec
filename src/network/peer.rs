//! Peers: authenticated connections to remote nodes
//!
//! A [`PeerConn`] is a raw transport that has not yet completed the
//! handshake. After [`PeerConn::handshake_timeout`] succeeds it is turned
//! into a [`Peer`], which multiplexes reactor channels over the stream.

use futures::sink::SinkExt;
use futures::stream::StreamExt;
use rand::RngCore;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::crypto::{sha256_concat, verify_signature, KeyError, KeyPair};
use crate::network::codec::FrameCodec;
use crate::network::config::PeerConfig;
use crate::network::connection::{
    BoxedStream, ConnectionError, ConnectionHandler, FramedStream, MConnection,
};
use crate::network::message::{Frame, Hello, Proof};
use crate::network::netaddress::NetAddress;
use crate::network::node_info::{NodeInfo, PeerId};
use crate::network::reactor::{ChannelDescriptor, ReactorsByChannel};

/// Size of the handshake challenge in bytes
pub const NONCE_SIZE: usize = 32;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// A connection failure reported by a running peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFailure {
    pub peer_id: PeerId,
    /// Identifies the connection instance, so stale reports can be ignored
    pub conn_id: u64,
    pub reason: String,
}

/// A transport that has not completed the handshake yet
pub struct PeerConn {
    stream: FramedStream,
    remote_addr: NetAddress,
    outbound: bool,
    config: PeerConfig,
}

impl PeerConn {
    pub fn new(stream: BoxedStream, remote_addr: NetAddress, outbound: bool, config: PeerConfig) -> Self {
        let codec = FrameCodec::new(config.mconfig.max_frame_size);
        Self {
            stream: Framed::new(stream, codec),
            remote_addr,
            outbound,
            config,
        }
    }

    /// Open an outbound TCP connection to `addr`
    pub async fn dial(addr: &NetAddress, config: PeerConfig) -> Result<Self, PeerError> {
        let stream = addr
            .dial_timeout(config.dial_timeout)
            .await
            .map_err(|e| PeerError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        log::debug!("Dialed {}", addr);
        Ok(Self::new(Box::new(stream), *addr, true, config))
    }

    pub fn remote_addr(&self) -> NetAddress {
        self.remote_addr
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    #[cfg(test)]
    pub(crate) fn stream_mut(&mut self) -> &mut FramedStream {
        &mut self.stream
    }

    /// Exchange node info and prove key ownership, failing after `timeout`
    ///
    /// Returns the peer's node info with `remote_addr` set to the address
    /// observed on the transport.
    pub async fn handshake_timeout(
        &mut self,
        our_info: &NodeInfo,
        our_key: &KeyPair,
        timeout: Duration,
    ) -> Result<NodeInfo, PeerError> {
        match tokio::time::timeout(timeout, self.handshake(our_info, our_key)).await {
            Ok(result) => result,
            Err(_) => Err(PeerError::HandshakeTimeout),
        }
    }

    async fn handshake(&mut self, our_info: &NodeInfo, our_key: &KeyPair) -> Result<NodeInfo, PeerError> {
        let mut our_nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut our_nonce);

        self.stream
            .send(Frame::Hello(Hello {
                node_info: our_info.clone(),
                nonce: hex::encode(our_nonce),
            }))
            .await?;

        let hello = match self.next_frame().await? {
            Frame::Hello(hello) => hello,
            other => {
                return Err(PeerError::Handshake(format!(
                    "expected Hello, got {}",
                    other.type_name()
                )))
            }
        };

        let their_key = hello
            .node_info
            .public_key()
            .map_err(|e| PeerError::Handshake(e.to_string()))?;
        let their_nonce = hex::decode(&hello.nonce)
            .ok()
            .filter(|nonce| nonce.len() == NONCE_SIZE)
            .ok_or_else(|| PeerError::Handshake("malformed nonce".to_string()))?;

        let challenge = sha256_concat(&[&their_nonce, &our_key.public_key.serialize()]);
        let signature = our_key.sign(&challenge)?;
        self.stream
            .send(Frame::Proof(Proof {
                signature: hex::encode(signature),
            }))
            .await?;

        let proof = match self.next_frame().await? {
            Frame::Proof(proof) => proof,
            other => {
                return Err(PeerError::Handshake(format!(
                    "expected Proof, got {}",
                    other.type_name()
                )))
            }
        };

        let signature = hex::decode(&proof.signature)
            .map_err(|_| PeerError::Handshake("malformed signature".to_string()))?;
        let expected = sha256_concat(&[&our_nonce, &their_key.serialize()]);
        let valid = verify_signature(&their_key, &expected, &signature)
            .map_err(|e| PeerError::Handshake(e.to_string()))?;
        if !valid {
            return Err(PeerError::Handshake(
                "peer does not own the advertised key".to_string(),
            ));
        }

        let mut peer_info = hello.node_info;
        peer_info.remote_addr = self.remote_addr.to_string();
        Ok(peer_info)
    }

    async fn next_frame(&mut self) -> Result<Frame, PeerError> {
        match self.stream.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => Err(PeerError::Io(e)),
            None => Err(PeerError::Handshake("connection closed".to_string())),
        }
    }

    /// Flush and shut down the transport
    pub async fn close(mut self) {
        if let Err(e) = self.stream.close().await {
            log::debug!("Error closing connection to {}: {}", self.remote_addr, e);
        }
    }
}

/// An authenticated, multiplexed connection to a remote node
pub struct Peer {
    key: PeerId,
    node_info: NodeInfo,
    outbound: bool,
    remote_addr: NetAddress,
    conn_id: u64,
    mconn: MConnection,
    reactors: Arc<ReactorsByChannel>,
    error_tx: mpsc::UnboundedSender<PeerFailure>,
    stopping: AtomicBool,
}

impl Peer {
    /// Wrap a handshaken connection. The peer does not run until [`Peer::start`].
    pub fn new(
        conn: PeerConn,
        node_info: NodeInfo,
        reactors: Arc<ReactorsByChannel>,
        descriptors: &[ChannelDescriptor],
        error_tx: mpsc::UnboundedSender<PeerFailure>,
    ) -> Result<Self, PeerError> {
        let key = node_info
            .id()
            .map_err(|e| PeerError::Handshake(e.to_string()))?;

        Ok(Self {
            key,
            node_info,
            outbound: conn.outbound,
            remote_addr: conn.remote_addr,
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            mconn: MConnection::new(conn.stream, descriptors, conn.config.mconfig),
            reactors,
            error_tx,
            stopping: AtomicBool::new(false),
        })
    }

    /// Start delivering inbound messages to reactors
    pub fn start(self: &Arc<Self>) -> Result<(), PeerError> {
        let handler = PeerHandler {
            peer: Arc::downgrade(self),
            peer_id: self.key.clone(),
            conn_id: self.conn_id,
            reactors: self.reactors.clone(),
            error_tx: self.error_tx.clone(),
        };
        self.mconn.start(Arc::new(handler))?;
        log::debug!("Started {}", self);
        Ok(())
    }

    pub fn stop(&self) {
        self.mconn.stop();
    }

    pub fn is_running(&self) -> bool {
        self.mconn.is_running()
    }

    /// Mark the peer as being torn down; true only for the first caller
    pub(crate) fn begin_stop(&self) -> bool {
        !self.stopping.swap(true, Ordering::SeqCst)
    }

    pub fn id(&self) -> &PeerId {
        &self.key
    }

    pub fn node_info(&self) -> &NodeInfo {
        &self.node_info
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Transport address of the remote end
    pub fn remote_addr(&self) -> NetAddress {
        self.remote_addr
    }

    /// Host of the transport address, the key used for bans
    pub fn remote_addr_host(&self) -> String {
        self.remote_addr.host()
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Queue a message, waiting for space in the channel's send queue
    pub async fn send(&self, channel_id: u8, msg: Vec<u8>) -> bool {
        self.mconn.send(channel_id, msg).await
    }

    /// Queue a message without waiting
    pub fn try_send(&self, channel_id: u8, msg: Vec<u8>) -> bool {
        self.mconn.try_send(channel_id, msg)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.outbound { "out" } else { "in" };
        write!(f, "Peer{{{} {} {}}}", self.key, direction, self.remote_addr)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

struct PeerHandler {
    peer: Weak<Peer>,
    peer_id: PeerId,
    conn_id: u64,
    reactors: Arc<ReactorsByChannel>,
    error_tx: mpsc::UnboundedSender<PeerFailure>,
}

impl ConnectionHandler for PeerHandler {
    fn on_receive(&self, channel_id: u8, msg: Vec<u8>) {
        let Some(peer) = self.peer.upgrade() else {
            return;
        };
        match self.reactors.get(&channel_id) {
            Some(reactor) => reactor.receive(channel_id, &peer, &msg),
            None => log::warn!("{} sent on unrouted channel {:#04x}", peer, channel_id),
        }
    }

    fn on_error(&self, reason: String) {
        log::debug!("Peer {} connection error: {}", self.peer_id, reason);
        let _ = self.error_tx.send(PeerFailure {
            peer_id: self.peer_id.clone(),
            conn_id: self.conn_id,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::{conn_pair, test_node_info, RecordingReactor};
    use std::collections::HashMap;

    async fn handshaken_pair(
        a_key: &KeyPair,
        b_key: &KeyPair,
    ) -> ((PeerConn, NodeInfo), (PeerConn, NodeInfo)) {
        let (mut a, mut b) = conn_pair(PeerConfig::default());
        let a_info = test_node_info(a_key, "127.0.0.1:20001");
        let b_info = test_node_info(b_key, "127.0.0.1:20002");
        let timeout = Duration::from_secs(2);

        let (a_seen, b_seen) = tokio::join!(
            a.handshake_timeout(&a_info, a_key, timeout),
            b.handshake_timeout(&b_info, b_key, timeout)
        );
        ((a, a_seen.unwrap()), (b, b_seen.unwrap()))
    }

    #[tokio::test]
    async fn test_handshake_exchanges_node_info() {
        let a_key = KeyPair::generate();
        let b_key = KeyPair::generate();
        let ((a, b_info), (b, a_info)) = handshaken_pair(&a_key, &b_key).await;

        assert_eq!(b_info.id().unwrap().as_str(), b_key.node_id());
        assert_eq!(a_info.id().unwrap().as_str(), a_key.node_id());
        assert_eq!(b_info.remote_addr, a.remote_addr().to_string());
        assert_eq!(a_info.remote_addr, b.remote_addr().to_string());
        assert!(a.is_outbound());
        assert!(!b.is_outbound());
    }

    #[tokio::test]
    async fn test_handshake_rejects_stolen_identity() {
        let (mut honest, raw) = conn_pair(PeerConfig::default());
        let mut raw = raw.stream;

        let honest_key = KeyPair::generate();
        let victim = KeyPair::generate();
        let attacker = KeyPair::generate();
        let honest_info = test_node_info(&honest_key, "127.0.0.1:20001");

        let attack = async {
            raw.send(Frame::Hello(Hello {
                node_info: test_node_info(&victim, "127.0.0.1:20002"),
                nonce: hex::encode([7u8; NONCE_SIZE]),
            }))
            .await
            .unwrap();

            let hello = match raw.next().await.unwrap().unwrap() {
                Frame::Hello(hello) => hello,
                other => panic!("unexpected {:?}", other),
            };
            let nonce = hex::decode(hello.nonce).unwrap();
            let challenge = sha256_concat(&[&nonce, &victim.public_key.serialize()]);
            let signature = attacker.sign(&challenge).unwrap();
            raw.send(Frame::Proof(Proof {
                signature: hex::encode(signature),
            }))
            .await
            .unwrap();
            let _ = raw.next().await;
        };

        let (result, _) = tokio::join!(
            honest.handshake_timeout(&honest_info, &honest_key, Duration::from_secs(2)),
            attack
        );
        assert!(matches!(result, Err(PeerError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (mut a, _b) = conn_pair(PeerConfig::default());
        let key = KeyPair::generate();
        let info = test_node_info(&key, "127.0.0.1:20001");

        let result = a
            .handshake_timeout(&info, &key, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(PeerError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn test_peers_route_messages_to_reactors() {
        let a_key = KeyPair::generate();
        let b_key = KeyPair::generate();
        let ((a_conn, b_info), (b_conn, a_info)) = handshaken_pair(&a_key, &b_key).await;

        let reactor = Arc::new(RecordingReactor::new("rec", &[0x01]));
        let descriptors = vec![ChannelDescriptor::new(0x01)];
        let mut routes: ReactorsByChannel = HashMap::new();
        routes.insert(0x01, reactor.clone());
        let routes = Arc::new(routes);

        let (a_err_tx, _a_err_rx) = mpsc::unbounded_channel();
        let (b_err_tx, mut b_err_rx) = mpsc::unbounded_channel();
        let a = Arc::new(Peer::new(a_conn, b_info, routes.clone(), &descriptors, a_err_tx).unwrap());
        let b = Arc::new(Peer::new(b_conn, a_info, routes, &descriptors, b_err_tx).unwrap());
        a.start().unwrap();
        b.start().unwrap();
        assert!(a.is_running());
        assert!(matches!(a.start(), Err(PeerError::Connection(_))));

        assert!(a.send(0x01, b"hi".to_vec()).await);
        let (channel_id, from, msg) = reactor.next_received().await;
        assert_eq!(channel_id, 0x01);
        assert_eq!(&from, a_key.node_id().as_str());
        assert_eq!(msg, b"hi".to_vec());

        a.stop();
        let failure = tokio::time::timeout(Duration::from_secs(2), b_err_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.peer_id, *b.id());
        assert_eq!(failure.conn_id, b.conn_id());
    }

    #[tokio::test]
    async fn test_begin_stop_only_once() {
        let a_key = KeyPair::generate();
        let b_key = KeyPair::generate();
        let ((a_conn, b_info), _) = handshaken_pair(&a_key, &b_key).await;
        let (err_tx, _err_rx) = mpsc::unbounded_channel();
        let peer = Peer::new(a_conn, b_info, Arc::new(HashMap::new()), &[], err_tx).unwrap();

        assert!(peer.begin_stop());
        assert!(!peer.begin_stop());
        assert!(peer.to_string().contains("out"));
        assert_eq!(format!("{:?}", peer), peer.to_string());
    }
}
