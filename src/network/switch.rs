//! Peer switch
//!
//! The [`Switch`] owns listeners, reactors and peers. It turns raw
//! connections into authenticated peers, filters out self-connections,
//! duplicates and banned hosts, and announces every peer that joins or
//! leaves to all registered reactors.
//!
//! Configuration (`add_reactor`, `add_listener`) happens on an owned
//! switch before it is wrapped in an [`Arc`] and started.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::crypto::KeyPair;
use crate::network::addrbook::AddrBook;
use crate::network::ban::{BanError, BanTable};
use crate::network::config::{P2pConfig, PeerConfig};
use crate::network::dialing::DialingRegistry;
use crate::network::listener::{InboundConn, Listener};
use crate::network::netaddress::{NetAddress, NetAddressError};
use crate::network::node_info::{NodeInfo, NodeInfoError, PeerId};
use crate::network::peer::{Peer, PeerConn, PeerError, PeerFailure};
use crate::network::peer_set::PeerSet;
use crate::network::reactor::{Reactor, ReactorError, ReactorRegistry};
use crate::storage::KvStore;

/// Inbound connections are refused once the peer count reaches this
/// multiple of `max_num_peers`
pub const INBOUND_ADMISSION_MULTIPLIER: usize = 2;

/// Switch errors
#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("Duplicate peer")]
    DuplicatePeer,
    #[error("Connect self")]
    ConnectSelf,
    #[error("Connect banned peer")]
    ConnectBannedPeer,
    #[error("Already dialing {0}")]
    AlreadyDialing(String),
    #[error("Switch already started")]
    AlreadyStarted,
    #[error("Incompatible node info: {0}")]
    IncompatibleNodeInfo(#[from] NodeInfoError),
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("Reactor {reactor} rejected peer: {source}")]
    ReactorRejected {
        reactor: String,
        source: ReactorError,
    },
    #[error("Reactor {reactor} failed to start: {source}")]
    ReactorStart {
        reactor: String,
        source: ReactorError,
    },
    #[error("Ban table error: {0}")]
    Ban(#[from] BanError),
    #[error("Address error: {0}")]
    Address(#[from] NetAddressError),
}

/// Best-effort snapshot of peer counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerCounts {
    pub outbound: usize,
    pub inbound: usize,
    pub dialing: usize,
}

/// Peer connection switch
pub struct Switch {
    config: P2pConfig,
    peer_config: PeerConfig,
    node_info: NodeInfo,
    node_key: KeyPair,
    node_id: PeerId,
    reactors: ReactorRegistry,
    listeners: Vec<Arc<dyn Listener>>,
    peers: PeerSet,
    dialing: DialingRegistry,
    bans: BanTable,
    addr_book: Arc<dyn AddrBook>,
    started: AtomicBool,
    running: AtomicBool,
    error_tx: mpsc::UnboundedSender<PeerFailure>,
    error_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerFailure>>>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl Switch {
    /// Create a switch. The ban table is loaded from `store`.
    pub fn new(
        config: P2pConfig,
        mut node_info: NodeInfo,
        node_key: KeyPair,
        addr_book: Arc<dyn AddrBook>,
        store: Arc<dyn KvStore>,
    ) -> Result<Self, SwitchError> {
        let bans = BanTable::load(store, config.ban_duration())?;
        let node_id = PeerId::from_public_key(&node_key.public_key);
        node_info.pub_key = node_key.public_key_hex();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        Ok(Self {
            peer_config: PeerConfig::from_p2p(&config),
            config,
            node_info,
            node_key,
            node_id,
            reactors: ReactorRegistry::new(),
            listeners: Vec::new(),
            peers: PeerSet::new(),
            dialing: DialingRegistry::new(),
            bans,
            addr_book,
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            error_tx,
            error_rx: Mutex::new(Some(error_rx)),
            accept_tasks: Mutex::new(Vec::new()),
            router: Mutex::new(None),
        })
    }

    /// Register a reactor and advertise its channels
    ///
    /// # Panics
    ///
    /// Panics if a channel is already owned by another reactor or the name
    /// is taken.
    pub fn add_reactor(&mut self, name: &str, reactor: Arc<dyn Reactor>) -> Arc<dyn Reactor> {
        let reactor = self.reactors.add(name, reactor);
        for desc in reactor.channels() {
            self.node_info.channels.push(desc.id);
        }
        reactor
    }

    pub fn reactor(&self, name: &str) -> Option<&Arc<dyn Reactor>> {
        self.reactors.get(name)
    }

    pub fn reactors(&self) -> &ReactorRegistry {
        &self.reactors
    }

    pub fn add_listener(&mut self, listener: Arc<dyn Listener>) {
        self.listeners.push(listener);
    }

    pub fn listeners(&self) -> &[Arc<dyn Listener>] {
        &self.listeners
    }

    pub fn is_listening(&self) -> bool {
        !self.listeners.is_empty()
    }

    pub fn listen_addresses(&self) -> Vec<NetAddress> {
        self.listeners.iter().map(|l| l.internal_address()).collect()
    }

    pub fn node_info(&self) -> &NodeInfo {
        &self.node_info
    }

    pub fn node_id(&self) -> &PeerId {
        &self.node_id
    }

    pub fn config(&self) -> &P2pConfig {
        &self.config
    }

    pub fn peer_config(&self) -> &PeerConfig {
        &self.peer_config
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn ban_table(&self) -> &BanTable {
        &self.bans
    }

    pub fn addr_book(&self) -> &Arc<dyn AddrBook> {
        &self.addr_book
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_dialing(&self, addr: &NetAddress) -> bool {
        self.dialing.contains(&addr.host())
    }

    pub fn num_peers(&self) -> PeerCounts {
        let (outbound, inbound) = self.peers.direction_counts();
        PeerCounts {
            outbound,
            inbound,
            dialing: self.dialing.len(),
        }
    }

    /// Start reactors, peers registered so far, and one accept loop per listener
    pub fn start(self: &Arc<Self>) -> Result<(), SwitchError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SwitchError::AlreadyStarted);
        }

        for (_, reactor) in self.reactors.iter() {
            reactor.set_switch(Arc::downgrade(self));
        }
        for (name, reactor) in self.reactors.iter() {
            reactor.start().map_err(|source| SwitchError::ReactorStart {
                reactor: name.to_string(),
                source,
            })?;
        }

        self.running.store(true, Ordering::SeqCst);

        for peer in self.peers.list() {
            if let Err(e) = self.notify_reactors_added(&peer) {
                log::warn!("Dropping {}: {}", peer, e);
                if peer.begin_stop() {
                    self.peers.remove(&peer);
                    peer.stop();
                }
                continue;
            }
            if let Err(e) = peer.start() {
                self.stop_and_remove_peer(&peer, Some(&e.to_string()));
            }
        }

        let error_rx = self
            .error_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(error_rx) = error_rx {
            let router = tokio::spawn(route_peer_failures(Arc::downgrade(self), error_rx));
            *self.router.lock().unwrap_or_else(PoisonError::into_inner) = Some(router);
        }

        let mut accept_tasks = self.accept_tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for listener in &self.listeners {
            match listener.take_connections() {
                Some(connections) => {
                    accept_tasks.push(tokio::spawn(accept_routine(
                        Arc::downgrade(self),
                        connections,
                    )));
                }
                None => log::warn!(
                    "Listener {} has no connection stream",
                    listener.internal_address()
                ),
            }
        }

        log::info!(
            "Switch started: node {} with {} reactors, {} listeners",
            self.node_id,
            self.reactors.len(),
            self.listeners.len()
        );
        Ok(())
    }

    /// Stop listeners, then peers, then reactors
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for listener in &self.listeners {
            listener.stop();
        }
        let accept_tasks =
            std::mem::take(&mut *self.accept_tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in accept_tasks {
            let _ = task.await;
        }

        for peer in self.peers.list() {
            self.stop_and_remove_peer(&peer, None);
        }

        for (_, reactor) in self.reactors.iter() {
            reactor.stop();
        }

        if let Some(router) = self.router.lock().unwrap_or_else(PoisonError::into_inner).take() {
            router.abort();
        }
        log::info!("Switch stopped");
    }

    /// Handshake `conn`, validate the peer and register it
    ///
    /// On any failure the connection is closed and nothing is registered.
    pub async fn add_peer(&self, mut conn: PeerConn) -> Result<Arc<Peer>, SwitchError> {
        let timeout = self.peer_config.handshake_timeout;
        let peer_info = match conn
            .handshake_timeout(&self.node_info, &self.node_key, timeout)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                conn.close().await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.node_info.compatible_with(&peer_info) {
            conn.close().await;
            return Err(e.into());
        }

        let descriptors = self.reactors.descriptors();
        let peer = Arc::new(Peer::new(
            conn,
            peer_info,
            self.reactors.by_channel(),
            &descriptors,
            self.error_tx.clone(),
        )?);

        if let Err(e) = self.filter_conn_by_peer(&peer) {
            peer.stop();
            return Err(e);
        }

        let running = self.is_running();
        if running {
            if let Err(e) = self.notify_reactors_added(&peer) {
                peer.stop();
                return Err(e);
            }
        }

        if self.peers.add(peer.clone()).is_err() {
            if running {
                for (_, reactor) in self.reactors.iter() {
                    reactor.remove_peer(&peer, Some("duplicate peer"));
                }
            }
            peer.stop();
            return Err(SwitchError::DuplicatePeer);
        }

        // Pumps start after registration so an early connection failure
        // always finds the peer in the set
        if running {
            if let Err(e) = peer.start() {
                self.stop_and_remove_peer(&peer, Some(&e.to_string()));
                return Err(e.into());
            }
        }

        log::info!("Added peer: {}", peer);
        Ok(peer)
    }

    /// Admit a raw inbound connection
    pub async fn add_peer_with_connection(&self, conn: InboundConn) -> Result<Arc<Peer>, SwitchError> {
        let remote_addr = conn.remote_addr;
        if self.bans.is_banned(&remote_addr.host()) {
            return Err(SwitchError::ConnectBannedPeer);
        }

        let peer_conn = PeerConn::new(conn.stream, remote_addr, false, self.peer_config.clone());
        let peer = self.add_peer(peer_conn).await?;

        // Remember where the peer accepts connections
        if let Ok(mut listen) = peer.node_info().listen_address() {
            if listen.is_unspecified() {
                listen.ip = remote_addr.ip;
            }
            if let Err(e) = self.addr_book.add_address(&listen, &remote_addr) {
                log::debug!("Address book rejected {}: {}", listen, e);
            }
        }

        Ok(peer)
    }

    /// Dial `addr` and add the resulting peer
    pub async fn dial_peer_with_address(&self, addr: &NetAddress) -> Result<Arc<Peer>, SwitchError> {
        let host = addr.host();
        let _guard = self
            .dialing
            .try_begin(&host)
            .ok_or_else(|| SwitchError::AlreadyDialing(host.clone()))?;

        self.filter_conn_by_addr(addr)?;

        log::debug!("Dialing peer {}", addr);
        let conn = PeerConn::dial(addr, self.peer_config.clone()).await?;
        let peer = match self.add_peer(conn).await {
            Ok(peer) => peer,
            Err(e) => {
                log::debug!("Failed to add dialed peer {}: {}", addr, e);
                return Err(e);
            }
        };

        self.addr_book.mark_good(addr);
        Ok(peer)
    }

    /// Ban the peer's remote host for the default duration
    pub fn add_banned_peer(&self, peer: &Peer) -> Result<(), SwitchError> {
        self.bans.ban(&peer.remote_addr_host())?;
        Ok(())
    }

    /// Disconnect a peer that misbehaved or whose connection failed
    pub fn stop_peer_for_error(&self, peer: &Arc<Peer>, reason: &str) {
        log::info!("Stopping peer for error: {} ({})", peer, reason);
        self.stop_and_remove_peer(peer, Some(reason));
    }

    pub fn stop_peer_gracefully(&self, peer: &Arc<Peer>) {
        log::info!("Stopping peer gracefully: {}", peer);
        self.stop_and_remove_peer(peer, None);
    }

    fn stop_and_remove_peer(&self, peer: &Arc<Peer>, reason: Option<&str>) {
        if !peer.begin_stop() {
            return;
        }

        for (_, reactor) in self.reactors.iter() {
            reactor.remove_peer(peer, reason);
        }
        self.peers.remove(peer);
        peer.stop();
        log::info!("Removed peer: {}", peer);
    }

    /// Announce `peer` to every reactor. If one rejects it, those that
    /// already accepted it are told it is gone.
    fn notify_reactors_added(&self, peer: &Arc<Peer>) -> Result<(), SwitchError> {
        let mut accepted: Vec<&Arc<dyn Reactor>> = Vec::new();
        for (name, reactor) in self.reactors.iter() {
            if let Err(source) = reactor.add_peer(peer) {
                let reason = format!("rejected by {}: {}", name, source);
                for reactor in accepted {
                    reactor.remove_peer(peer, Some(&reason));
                }
                return Err(SwitchError::ReactorRejected {
                    reactor: name.to_string(),
                    source,
                });
            }
            accepted.push(reactor);
        }
        Ok(())
    }

    fn handle_peer_failure(&self, failure: PeerFailure) {
        match self.peers.get(&failure.peer_id) {
            Some(peer) if peer.conn_id() == failure.conn_id => {
                self.stop_peer_for_error(&peer, &failure.reason)
            }
            _ => log::debug!(
                "Ignoring stale failure for {}: {}",
                failure.peer_id,
                failure.reason
            ),
        }
    }

    fn filter_conn_by_addr(&self, addr: &NetAddress) -> Result<(), SwitchError> {
        if self.is_own_address(addr) {
            self.addr_book_del_self();
            return Err(SwitchError::ConnectSelf);
        }
        if self.bans.is_banned(&addr.host()) {
            return Err(SwitchError::ConnectBannedPeer);
        }
        Ok(())
    }

    fn filter_conn_by_peer(&self, peer: &Peer) -> Result<(), SwitchError> {
        if self.bans.is_banned(&peer.remote_addr_host()) {
            return Err(SwitchError::ConnectBannedPeer);
        }
        if *peer.id() == self.node_id {
            self.addr_book_del_self();
            return Err(SwitchError::ConnectSelf);
        }
        if self.peers.has(peer.id()) {
            return Err(SwitchError::DuplicatePeer);
        }
        Ok(())
    }

    fn is_own_address(&self, addr: &NetAddress) -> bool {
        let mut own = self.listen_addresses();
        own.extend(self.node_info.listen_address().ok());
        if let Some(external) = &self.config.external_address {
            own.extend(external.parse::<NetAddress>().ok());
        }

        // Any port on one of our hosts is us
        own.iter()
            .any(|ours| ours.ip == addr.ip || (ours.is_unspecified() && addr.ip.is_loopback()))
    }

    // Our address may have ended up in the book as a peer
    fn addr_book_del_self(&self) {
        match self.node_info.listen_address() {
            Ok(addr) => {
                self.addr_book.remove_address(&addr);
                self.addr_book.add_our_address(&addr);
            }
            Err(e) => log::debug!("Cannot record own address: {}", e),
        }
    }
}

async fn route_peer_failures(
    switch: Weak<Switch>,
    mut failures: mpsc::UnboundedReceiver<PeerFailure>,
) {
    while let Some(failure) = failures.recv().await {
        let Some(sw) = switch.upgrade() else {
            break;
        };
        sw.handle_peer_failure(failure);
    }
}

async fn accept_routine(switch: Weak<Switch>, mut connections: mpsc::Receiver<InboundConn>) {
    while let Some(conn) = connections.recv().await {
        let Some(sw) = switch.upgrade() else {
            break;
        };
        if !sw.is_running() {
            break;
        }

        let max_peers = sw.config.max_num_peers * INBOUND_ADMISSION_MULTIPLIER;
        if sw.peers.size() >= max_peers {
            log::info!(
                "Ignoring inbound connection from {}: already have enough peers",
                conn.remote_addr
            );
            continue;
        }

        let remote_addr = conn.remote_addr;
        if let Err(e) = sw.add_peer_with_connection(conn).await {
            log::info!("Ignoring inbound connection from {}: {}", remote_addr, e);
        }
    }
}
