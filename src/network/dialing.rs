//! In-flight dial deduplication
//!
//! Hosts are registered for the duration of a dial attempt. The returned
//! [`DialGuard`] releases the entry when dropped, whatever the outcome.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

/// Set of hosts currently being dialed
#[derive(Debug, Default)]
pub struct DialingRegistry {
    hosts: Mutex<HashSet<String>>,
}

impl DialingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `host` for a dial; `None` if another dial already holds it
    pub fn try_begin(&self, host: &str) -> Option<DialGuard<'_>> {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        if !hosts.insert(host.to_string()) {
            return None;
        }
        Some(DialGuard {
            registry: self,
            host: host.to_string(),
        })
    }

    pub fn contains(&self, host: &str) -> bool {
        self.hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(host)
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, host: &str) {
        self.hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(host);
    }
}

/// Holds a dialing registry entry until dropped
#[derive(Debug)]
pub struct DialGuard<'a> {
    registry: &'a DialingRegistry,
    host: String,
}

impl DialGuard<'_> {
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.host);
    }
}
