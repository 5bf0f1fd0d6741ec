//! Banned host table
//!
//! Maps a remote host to the time its ban expires. The whole table is
//! mirrored to the key-value store under [`BANNED_PEER_KEY`] on every
//! mutation. Expired entries are purged lazily when looked up.
//!
//! Persistence is best effort: when writing the store fails the error is
//! returned but the in-memory change is kept.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::storage::{KvStore, StorageError};

/// Store key holding the serialized table
pub const BANNED_PEER_KEY: &[u8] = b"BannedPeer";

/// Ban table errors
#[derive(Error, Debug)]
pub enum BanError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

type Entries = HashMap<String, DateTime<Utc>>;

/// Host to ban-expiry table backed by a [`KvStore`]
pub struct BanTable {
    entries: Mutex<Entries>,
    store: Arc<dyn KvStore>,
    ban_duration: Duration,
}

impl BanTable {
    /// Load the table from `store`. A missing key yields an empty table.
    pub fn load(store: Arc<dyn KvStore>, ban_duration: Duration) -> Result<Self, BanError> {
        let entries = match store.get(BANNED_PEER_KEY)? {
            Some(blob) => serde_json::from_slice(&blob)?,
            None => Entries::new(),
        };

        if !entries.is_empty() {
            log::debug!("Loaded {} banned hosts", entries.len());
        }

        Ok(Self {
            entries: Mutex::new(entries),
            store,
            ban_duration,
        })
    }

    /// Ban `host` for the default duration, returning the expiry
    pub fn ban(&self, host: &str) -> Result<DateTime<Utc>, BanError> {
        // Durations past chrono's range ban for as long as it can represent
        let expiry = chrono::Duration::from_std(self.ban_duration)
            .ok()
            .and_then(|duration| Utc::now().checked_add_signed(duration))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.ban_until(host, expiry)?;
        Ok(expiry)
    }

    /// Ban `host` until `expiry`
    pub fn ban_until(&self, host: &str, expiry: DateTime<Utc>) -> Result<(), BanError> {
        let mut entries = self.lock();
        entries.insert(host.to_string(), expiry);
        log::info!("Banned {} until {}", host, expiry);
        self.persist(&entries)
    }

    /// Whether `host` is banned right now. An expired entry is removed.
    pub fn is_banned(&self, host: &str) -> bool {
        let mut entries = self.lock();
        let expiry = match entries.get(host) {
            Some(expiry) => *expiry,
            None => return false,
        };

        if Utc::now() < expiry {
            return true;
        }

        entries.remove(host);
        log::debug!("Ban on {} expired", host);
        if let Err(e) = self.persist(&entries) {
            log::warn!("Failed to persist ban table: {}", e);
        }
        false
    }

    /// Lift the ban on `host`; returns whether an entry existed
    pub fn unban(&self, host: &str) -> Result<bool, BanError> {
        let mut entries = self.lock();
        if entries.remove(host).is_none() {
            return Ok(false);
        }
        log::info!("Unbanned {}", host);
        self.persist(&entries)?;
        Ok(true)
    }

    /// Snapshot of all entries, including expired ones not yet purged
    pub fn entries(&self) -> BTreeMap<String, DateTime<Utc>> {
        self.lock()
            .iter()
            .map(|(host, expiry)| (host.clone(), *expiry))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ban_duration(&self) -> Duration {
        self.ban_duration
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Called with the table lock held so the store mirrors mutation order
    fn persist(&self, entries: &Entries) -> Result<(), BanError> {
        let blob = serde_json::to_vec(entries)?;
        self.store.set(BANNED_PEER_KEY, &blob)?;
        Ok(())
    }
}
