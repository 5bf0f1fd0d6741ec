//! Shared fixtures for network tests

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::crypto::KeyPair;
use crate::network::addrbook::{AddrBook, AddrBookError};
use crate::network::config::{P2pConfig, PeerConfig};
use crate::network::listener::{InboundConn, Listener};
use crate::network::netaddress::NetAddress;
use crate::network::node_info::{NodeInfo, PeerId};
use crate::network::peer::{Peer, PeerConn};
use crate::network::reactor::{ChannelDescriptor, Reactor, ReactorError};
use crate::network::switch::{Switch, SwitchError};
use crate::storage::MemoryStore;

pub const TEST_CHANNEL: u8 = 0x01;

pub fn test_node_info(key: &KeyPair, listen_addr: &str) -> NodeInfo {
    let mut info = NodeInfo::new("test", "testnet", listen_addr);
    info.pub_key = key.public_key_hex();
    info
}

/// In-memory connection pair; the first end is outbound
pub fn conn_pair(config: PeerConfig) -> (PeerConn, PeerConn) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (
        PeerConn::new(Box::new(a), "127.0.0.1:20002".parse().unwrap(), true, config.clone()),
        PeerConn::new(Box::new(b), "127.0.0.1:20001".parse().unwrap(), false, config),
    )
}

/// A peer that skipped the handshake and is never started
pub fn test_peer(key: &KeyPair, outbound: bool) -> Arc<Peer> {
    let (a, b) = conn_pair(PeerConfig::default());
    let conn = if outbound { a } else { b };
    let (error_tx, _) = mpsc::unbounded_channel();
    Arc::new(
        Peer::new(
            conn,
            test_node_info(key, "127.0.0.1:20000"),
            Arc::new(HashMap::new()),
            &[],
            error_tx,
        )
        .unwrap(),
    )
}

/// Poll `check` until it holds or two seconds pass
pub async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactorEvent {
    Started,
    Stopped,
    Added {
        peer: PeerId,
        conn_id: u64,
    },
    Removed {
        peer: PeerId,
        conn_id: u64,
        reason: Option<String>,
        /// Whether the switch still listed the peer when notified
        registered: bool,
    },
}

/// Reactor that records every hook call
pub struct RecordingReactor {
    name: String,
    channels: Vec<u8>,
    reject: AtomicBool,
    switch: Mutex<Option<Weak<Switch>>>,
    events: Mutex<Vec<ReactorEvent>>,
    received_tx: mpsc::UnboundedSender<(u8, String, Vec<u8>)>,
    received_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(u8, String, Vec<u8>)>>,
}

impl RecordingReactor {
    pub fn new(name: &str, channels: &[u8]) -> Self {
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            channels: channels.to_vec(),
            reject: AtomicBool::new(false),
            switch: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            received_tx,
            received_rx: tokio::sync::Mutex::new(received_rx),
        }
    }

    pub fn rejecting(name: &str, channels: &[u8]) -> Self {
        let reactor = Self::new(name, channels);
        reactor.reject.store(true, Ordering::SeqCst);
        reactor
    }

    pub fn events(&self) -> Vec<ReactorEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn added(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ReactorEvent::Added { .. }))
            .count()
    }

    pub fn removals(&self) -> Vec<ReactorEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, ReactorEvent::Removed { .. }))
            .collect()
    }

    /// Next message delivered to this reactor as (channel, sender id, payload)
    pub async fn next_received(&self) -> (u8, String, Vec<u8>) {
        let mut rx = self.received_rx.lock().await;
        within(rx.recv()).await.expect("reactor dropped")
    }

    fn record(&self, event: ReactorEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl Reactor for RecordingReactor {
    fn set_switch(&self, switch: Weak<Switch>) {
        *self.switch.lock().unwrap() = Some(switch);
    }

    fn start(&self) -> Result<(), ReactorError> {
        self.record(ReactorEvent::Started);
        Ok(())
    }

    fn stop(&self) {
        self.record(ReactorEvent::Stopped);
    }

    fn channels(&self) -> Vec<ChannelDescriptor> {
        self.channels.iter().map(|id| ChannelDescriptor::new(*id)).collect()
    }

    fn add_peer(&self, peer: &Arc<Peer>) -> Result<(), ReactorError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(ReactorError::Rejected(format!("{} says no", self.name)));
        }
        self.record(ReactorEvent::Added {
            peer: peer.id().clone(),
            conn_id: peer.conn_id(),
        });
        Ok(())
    }

    fn remove_peer(&self, peer: &Arc<Peer>, reason: Option<&str>) {
        let registered = self
            .switch
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|sw| sw.peers().has(peer.id()))
            .unwrap_or(false);
        self.record(ReactorEvent::Removed {
            peer: peer.id().clone(),
            conn_id: peer.conn_id(),
            reason: reason.map(str::to_string),
            registered,
        });
    }

    fn receive(&self, channel_id: u8, peer: &Arc<Peer>, msg: &[u8]) {
        let _ = self
            .received_tx
            .send((channel_id, peer.id().to_string(), msg.to_vec()));
    }
}

/// Listener fed by the test through [`ChannelListener::inject`]
pub struct ChannelListener {
    addr: NetAddress,
    tx: Mutex<Option<mpsc::Sender<InboundConn>>>,
    rx: Mutex<Option<mpsc::Receiver<InboundConn>>>,
}

impl ChannelListener {
    pub fn new(addr: &str) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(16);
        Arc::new(Self {
            addr: addr.parse().unwrap(),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        })
    }

    pub async fn inject(&self, conn: InboundConn) {
        let tx = self.tx.lock().unwrap().clone().expect("listener stopped");
        tx.send(conn).await.unwrap();
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.lock().unwrap().is_none()
    }
}

impl Listener for ChannelListener {
    fn take_connections(&self) -> Option<mpsc::Receiver<InboundConn>> {
        self.rx.lock().unwrap().take()
    }

    fn internal_address(&self) -> NetAddress {
        self.addr
    }

    fn stop(&self) {
        self.tx.lock().unwrap().take();
    }
}

/// Address book that records calls
#[derive(Default)]
pub struct RecordingAddrBook {
    calls: Mutex<Vec<String>>,
}

impl RecordingAddrBook {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl AddrBook for RecordingAddrBook {
    fn add_address(&self, addr: &NetAddress, src: &NetAddress) -> Result<(), AddrBookError> {
        self.record(format!("add_address {} {}", addr, src));
        Ok(())
    }

    fn add_our_address(&self, addr: &NetAddress) {
        self.record(format!("add_our_address {}", addr));
    }

    fn mark_good(&self, addr: &NetAddress) {
        self.record(format!("mark_good {}", addr));
    }

    fn remove_address(&self, addr: &NetAddress) {
        self.record(format!("remove_address {}", addr));
    }

    fn save_to_file(&self) -> Result<(), AddrBookError> {
        self.record("save_to_file".to_string());
        Ok(())
    }
}

/// Everything a switch test needs to reach into
pub struct TestNode {
    pub switch: Switch,
    pub key: KeyPair,
    pub addr_book: Arc<RecordingAddrBook>,
    pub reactor: Arc<RecordingReactor>,
}

pub fn test_config(listen_addr: &str) -> P2pConfig {
    P2pConfig {
        listen_address: listen_addr.to_string(),
        handshake_timeout: 2,
        ..Default::default()
    }
}

/// Unstarted switch with a [`RecordingReactor`] named "rec" on [`TEST_CHANNEL`]
pub fn test_node(listen_addr: &str) -> TestNode {
    test_node_with_config(test_config(listen_addr))
}

pub fn test_node_with_config(config: P2pConfig) -> TestNode {
    let key = KeyPair::generate();
    let addr_book = Arc::new(RecordingAddrBook::default());
    let info = NodeInfo::new("test", "testnet", &config.listen_address);
    let mut switch = Switch::new(
        config,
        info,
        key.clone(),
        addr_book.clone(),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();

    let reactor = Arc::new(RecordingReactor::new("rec", &[TEST_CHANNEL]));
    switch.add_reactor("rec", reactor.clone());

    TestNode {
        switch,
        key,
        addr_book,
        reactor,
    }
}

/// Connect `from` to `to` over an in-memory pipe. `from` sees an outbound
/// peer, `to` an inbound connection arriving from `from`'s listen address.
pub async fn connect(
    from: &Switch,
    to: &Switch,
) -> (Result<Arc<Peer>, SwitchError>, Result<Arc<Peer>, SwitchError>) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let to_addr: NetAddress = to.node_info().listen_addr.parse().unwrap();
    let from_addr: NetAddress = from.node_info().listen_addr.parse().unwrap();

    let outbound = PeerConn::new(Box::new(a), to_addr, true, from.peer_config().clone());
    let inbound = InboundConn {
        stream: Box::new(b),
        remote_addr: from_addr,
    };

    within(async { tokio::join!(from.add_peer(outbound), to.add_peer_with_connection(inbound)) })
        .await
}
