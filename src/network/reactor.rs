//! Reactors and channel ownership
//!
//! A [`Reactor`] owns one or more logical channels and handles every message
//! that arrives on them. The switch keeps reactors in a [`ReactorRegistry`]
//! which guarantees that each channel id has exactly one owner.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;

use crate::network::config::DEFAULT_MAX_FRAME_SIZE;
use crate::network::peer::Peer;
use crate::network::switch::Switch;

/// Default channel priority
pub const DEFAULT_PRIORITY: u32 = 1;

/// Default number of queued outbound messages per channel
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 16;

/// Reactor errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReactorError {
    #[error("Reactor failed to start: {0}")]
    Start(String),
    #[error("Peer rejected: {0}")]
    Rejected(String),
}

/// Declaration of a logical channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub id: u8,
    /// Higher priority channels are flushed first
    pub priority: u32,
    pub send_queue_capacity: usize,
    /// Largest payload accepted on this channel
    pub recv_message_capacity: usize,
}

impl ChannelDescriptor {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            priority: DEFAULT_PRIORITY,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            recv_message_capacity: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_recv_message_capacity(mut self, capacity: usize) -> Self {
        self.recv_message_capacity = capacity;
        self
    }
}

/// Capability contract for channel-specific protocol handlers
///
/// Hooks are synchronous; reactors that need async work spawn tasks.
pub trait Reactor: Send + Sync {
    /// Called once when the switch starts, before [`Reactor::start`]
    fn set_switch(&self, _switch: Weak<Switch>) {}

    fn start(&self) -> Result<(), ReactorError> {
        Ok(())
    }

    fn stop(&self) {}

    /// Channels owned by this reactor
    fn channels(&self) -> Vec<ChannelDescriptor>;

    /// A new peer is connected. Returning an error aborts the peer's admission.
    fn add_peer(&self, _peer: &Arc<Peer>) -> Result<(), ReactorError> {
        Ok(())
    }

    /// A peer is being removed; `reason` is `None` for graceful stops
    ///
    /// A connection that loses an identity race after `add_peer` is removed
    /// with reason `"duplicate peer"` while another connection with the same
    /// [`Peer::id`] stays registered. Reactors keeping per-peer state should
    /// check [`Peer::conn_id`] before discarding it.
    fn remove_peer(&self, _peer: &Arc<Peer>, _reason: Option<&str>) {}

    /// A message arrived on one of this reactor's channels
    fn receive(&self, channel_id: u8, peer: &Arc<Peer>, msg: &[u8]);
}

/// Channel id to reactor routing table
pub type ReactorsByChannel = HashMap<u8, Arc<dyn Reactor>>;

/// Registered reactors, in registration order
#[derive(Default, Clone)]
pub struct ReactorRegistry {
    reactors: Vec<(String, Arc<dyn Reactor>)>,
    by_channel: Arc<ReactorsByChannel>,
    descriptors: Arc<Vec<ChannelDescriptor>>,
}

impl ReactorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reactor under `name`
    ///
    /// # Panics
    ///
    /// Panics if one of the reactor's channels is already owned by another
    /// reactor, or if `name` is already taken. Both are configuration bugs.
    pub fn add(&mut self, name: &str, reactor: Arc<dyn Reactor>) -> Arc<dyn Reactor> {
        if self.get(name).is_some() {
            panic!("Reactor name {} registered twice", name);
        }

        let channels = reactor.channels();
        for desc in &channels {
            if self.by_channel.contains_key(&desc.id) {
                let owner = self.owner_name(desc.id).unwrap_or("unknown");
                panic!(
                    "Channel {:#04x} has multiple reactors {} & {}",
                    desc.id, owner, name
                );
            }
        }

        let by_channel = Arc::make_mut(&mut self.by_channel);
        let descriptors = Arc::make_mut(&mut self.descriptors);
        for desc in channels {
            by_channel.insert(desc.id, reactor.clone());
            descriptors.push(desc);
        }

        self.reactors.push((name.to_string(), reactor.clone()));
        reactor
    }

    /// Look up a reactor by name
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Reactor>> {
        self.reactors
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, reactor)| reactor)
    }

    /// Reactor owning `channel_id`
    pub fn for_channel(&self, channel_id: u8) -> Option<&Arc<dyn Reactor>> {
        self.by_channel.get(&channel_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Reactor>)> {
        self.reactors
            .iter()
            .map(|(name, reactor)| (name.as_str(), reactor))
    }

    pub fn by_channel(&self) -> Arc<ReactorsByChannel> {
        self.by_channel.clone()
    }

    pub fn descriptors(&self) -> Arc<Vec<ChannelDescriptor>> {
        self.descriptors.clone()
    }

    pub fn channel_ids(&self) -> Vec<u8> {
        self.descriptors.iter().map(|d| d.id).collect()
    }

    pub fn len(&self) -> usize {
        self.reactors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactors.is_empty()
    }

    fn owner_name(&self, channel_id: u8) -> Option<&str> {
        let owner = self.by_channel.get(&channel_id)?;
        self.reactors
            .iter()
            .find(|(_, reactor)| Arc::ptr_eq(reactor, owner))
            .map(|(name, _)| name.as_str())
    }
}
