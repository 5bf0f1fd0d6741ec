//! Address book
//!
//! The switch records addresses it learns about and keeps its own address
//! out of the book through the [`AddrBook`] capability. [`AddrManager`] is
//! the default implementation: a new/tried table persisted as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::network::netaddress::NetAddress;

/// Address book errors
#[derive(Error, Debug)]
pub enum AddrBookError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Address not accepted: {0}")]
    Rejected(String),
}

/// Capabilities the switch needs from an address book
pub trait AddrBook: Send + Sync {
    /// Record `addr`, learned from `src`
    fn add_address(&self, addr: &NetAddress, src: &NetAddress) -> Result<(), AddrBookError>;

    /// Mark `addr` as one of our own; it is never handed out as a peer
    fn add_our_address(&self, addr: &NetAddress);

    /// A connection to `addr` succeeded
    fn mark_good(&self, addr: &NetAddress);

    fn remove_address(&self, addr: &NetAddress);

    fn save_to_file(&self) -> Result<(), AddrBookError>;
}

/// Address entry with connection history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddrEntry {
    pub addr: NetAddress,
    /// Peer that told us about this address
    pub source: Option<NetAddress>,
    pub attempts: u32,
    pub successes: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    /// Whether we have connected to this address before
    pub in_tried: bool,
}

impl AddrEntry {
    pub fn new(addr: NetAddress, source: Option<NetAddress>) -> Self {
        Self {
            addr,
            source,
            attempts: 0,
            successes: 0,
            last_attempt: None,
            last_success: None,
            in_tried: false,
        }
    }

    /// Too many failed attempts to be worth dialing
    pub fn is_terrible(&self) -> bool {
        self.last_attempt.is_some() && self.successes == 0 && self.attempts >= 3
    }

    pub fn attempt(&mut self) {
        self.attempts += 1;
        self.last_attempt = Some(Utc::now());
    }

    pub fn good(&mut self) {
        self.successes += 1;
        self.last_success = Some(Utc::now());
        self.attempts = 0;
        self.in_tried = true;
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Book {
    addrs: HashMap<String, AddrEntry>,
    ours: HashSet<String>,
}

/// JSON-file-backed address book
#[derive(Debug, Default)]
pub struct AddrManager {
    path: Option<PathBuf>,
    book: Mutex<Book>,
}

impl AddrManager {
    /// In-memory book, [`AddrBook::save_to_file`] is a no-op
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the book at `path`; a missing file yields an empty book
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AddrBookError> {
        let path = path.as_ref().to_path_buf();
        let book = if path.exists() {
            let file = fs::File::open(&path)?;
            serde_json::from_reader(BufReader::new(file))?
        } else {
            Book::default()
        };

        log::info!("Loaded {} addresses from {}", book.addrs.len(), path.display());
        Ok(Self {
            path: Some(path),
            book: Mutex::new(book),
        })
    }

    pub fn size(&self) -> usize {
        self.lock().addrs.len()
    }

    pub fn new_count(&self) -> usize {
        self.lock().addrs.values().filter(|e| !e.in_tried).count()
    }

    pub fn tried_count(&self) -> usize {
        self.lock().addrs.values().filter(|e| e.in_tried).count()
    }

    pub fn contains(&self, addr: &NetAddress) -> bool {
        self.lock().addrs.contains_key(&addr.to_string())
    }

    pub fn is_our_address(&self, addr: &NetAddress) -> bool {
        self.lock().ours.contains(&addr.to_string())
    }

    pub fn entry(&self, addr: &NetAddress) -> Option<AddrEntry> {
        self.lock().addrs.get(&addr.to_string()).cloned()
    }

    /// Record a dial attempt
    pub fn attempt(&self, addr: &NetAddress) {
        if let Some(entry) = self.lock().addrs.get_mut(&addr.to_string()) {
            entry.attempt();
        }
    }

    /// Addresses worth dialing, most successful first
    pub fn addresses(&self) -> Vec<NetAddress> {
        let book = self.lock();
        let mut entries: Vec<&AddrEntry> =
            book.addrs.values().filter(|e| !e.is_terrible()).collect();
        entries.sort_by(|a, b| b.successes.cmp(&a.successes));
        entries.into_iter().map(|e| e.addr).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AddrBook for AddrManager {
    fn add_address(&self, addr: &NetAddress, src: &NetAddress) -> Result<(), AddrBookError> {
        if addr.is_unspecified() || addr.port == 0 {
            return Err(AddrBookError::Rejected(addr.to_string()));
        }

        let key = addr.to_string();
        let mut book = self.lock();
        if book.ours.contains(&key) {
            return Err(AddrBookError::Rejected(format!("{} is our own address", key)));
        }

        book.addrs
            .entry(key)
            .or_insert_with(|| AddrEntry::new(*addr, Some(*src)));
        Ok(())
    }

    fn add_our_address(&self, addr: &NetAddress) {
        log::debug!("Add our address to book: {}", addr);
        self.lock().ours.insert(addr.to_string());
    }

    fn mark_good(&self, addr: &NetAddress) {
        if let Some(entry) = self.lock().addrs.get_mut(&addr.to_string()) {
            entry.good();
        }
    }

    fn remove_address(&self, addr: &NetAddress) {
        self.lock().addrs.remove(&addr.to_string());
    }

    fn save_to_file(&self) -> Result<(), AddrBookError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let book = self.lock();

        // Write to temporary file first
        let temp_path = path.with_extension("tmp");
        let file = fs::File::create(&temp_path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &*book)?;

        // Atomic rename
        fs::rename(&temp_path, path)?;
        log::info!("Saved {} addresses to {}", book.addrs.len(), path.display());
        Ok(())
    }
}
