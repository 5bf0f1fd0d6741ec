//! Minimal keepalive reactor
//!
//! Sends `ping` to every new peer and answers `ping` with `pong`. Anything
//! else on the channel is a protocol violation and disconnects the peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::network::peer::Peer;
use crate::network::reactor::{ChannelDescriptor, Reactor, ReactorError};
use crate::network::switch::Switch;

/// Channel owned by [`PingReactor`]
pub const PING_CHANNEL: u8 = 0x01;

pub const PING: &[u8] = b"ping";
pub const PONG: &[u8] = b"pong";

#[derive(Default)]
pub struct PingReactor {
    switch: Mutex<Option<Weak<Switch>>>,
    pings_received: AtomicU64,
    pongs_received: AtomicU64,
}

impl PingReactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pings_received(&self) -> u64 {
        self.pings_received.load(Ordering::Relaxed)
    }

    pub fn pongs_received(&self) -> u64 {
        self.pongs_received.load(Ordering::Relaxed)
    }

    fn switch(&self) -> Option<Arc<Switch>> {
        self.switch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

impl Reactor for PingReactor {
    fn set_switch(&self, switch: Weak<Switch>) {
        *self.switch.lock().unwrap_or_else(PoisonError::into_inner) = Some(switch);
    }

    fn channels(&self) -> Vec<ChannelDescriptor> {
        vec![ChannelDescriptor::new(PING_CHANNEL)
            .with_priority(5)
            .with_recv_message_capacity(64)]
    }

    fn add_peer(&self, peer: &Arc<Peer>) -> Result<(), ReactorError> {
        // Queued now, flushed once the peer's pumps start
        if !peer.try_send(PING_CHANNEL, PING.to_vec()) {
            log::debug!("Could not queue ping for {}", peer);
        }
        Ok(())
    }

    fn remove_peer(&self, peer: &Arc<Peer>, reason: Option<&str>) {
        log::debug!("Ping reactor dropping {} ({:?})", peer, reason);
    }

    fn receive(&self, _channel_id: u8, peer: &Arc<Peer>, msg: &[u8]) {
        match msg {
            PING => {
                self.pings_received.fetch_add(1, Ordering::Relaxed);
                if !peer.try_send(PING_CHANNEL, PONG.to_vec()) {
                    log::debug!("Dropped pong to {}", peer);
                }
            }
            PONG => {
                self.pongs_received.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                log::warn!("{} sent an invalid ping message", peer);
                if let Some(switch) = self.switch() {
                    switch.stop_peer_for_error(peer, "invalid ping message");
                }
            }
        }
    }
}
