//! Byte-oriented key-value stores
//!
//! The switch persists small blobs (the ban table) through the [`KvStore`]
//! capability. Two backends are provided: an in-memory map and a JSON file
//! that is rewritten atomically on every mutation.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// A generic byte-keyed store
pub trait KvStore: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`; returns whether it was present
    fn delete(&self, key: &[u8]) -> Result<bool, StorageError>;
}

/// In-memory store, contents are lost on drop
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Vec<u8>, Vec<u8>>>, StorageError> {
        self.entries
            .lock()
            .map_err(|_| StorageError::InvalidData("store lock poisoned".to_string()))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.lock()?.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.lock()?.remove(key).is_some())
    }
}

/// JSON-file-backed store
///
/// Keys and values are hex encoded. The whole file is rewritten through a
/// temporary file and an atomic rename whenever the contents change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`, loading existing contents if the file exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let entries = if path.exists() {
            let file = fs::File::open(&path)?;
            serde_json::from_reader(BufReader::new(file))?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, StorageError> {
        self.entries
            .lock()
            .map_err(|_| StorageError::InvalidData("store lock poisoned".to_string()))
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        // Write to temporary file first
        let temp_path = self.path.with_extension("tmp");
        let file = fs::File::create(&temp_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, entries)?;

        // Atomic rename
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let entries = self.lock()?;
        match entries.get(&hex::encode(key)) {
            Some(value) => hex::decode(value)
                .map(Some)
                .map_err(|e| StorageError::InvalidData(e.to_string())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut entries = self.lock()?;
        entries.insert(hex::encode(key), hex::encode(value));
        self.flush(&entries)
    }

    fn delete(&self, key: &[u8]) -> Result<bool, StorageError> {
        let mut entries = self.lock()?;
        let existed = entries.remove(&hex::encode(key)).is_some();
        if existed {
            self.flush(&entries)?;
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.get(b"missing").unwrap().is_none());

        store.set(b"key", b"value").unwrap();
        assert_eq!(store.get(b"key").unwrap(), Some(b"value".to_vec()));
        assert_eq!(store.len(), 1);

        assert!(store.delete(b"key").unwrap());
        assert!(!store.delete(b"key").unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("store.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.set(b"BannedPeer", b"{\"1.2.3.4\":1}").unwrap();
            store.set(b"other", &[0, 1, 2]).unwrap();
        }

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(
            reopened.get(b"BannedPeer").unwrap(),
            Some(b"{\"1.2.3.4\":1}".to_vec())
        );
        assert_eq!(reopened.get(b"other").unwrap(), Some(vec![0, 1, 2]));

        assert!(reopened.delete(b"other").unwrap());
        let again = FileStore::open(&path).unwrap();
        assert!(again.get(b"other").unwrap().is_none());
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("store.json");
        fs::write(&path, b"not json").unwrap();

        assert!(matches!(
            FileStore::open(&path),
            Err(StorageError::SerializationError(_))
        ));
    }
}
