//! Storage module for switch persistence

pub mod kv;

pub use kv::{FileStore, KvStore, MemoryStore, StorageError};
