//! Hashing utilities for node identities and handshake challenges
//!
//! Provides the SHA-256 helpers used to derive peer ids from public keys
//! and to build the digests signed during the authenticated handshake.

use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Computes SHA-256 over the concatenation of several byte slices
pub fn sha256_concat(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}
