//! Cryptographic utilities for node identity
//!
//! This module provides:
//! - SHA-256 hashing
//! - secp256k1 node keys, signing and verification
//! - Node id derivation

pub mod hash;
pub mod keys;

pub use hash::{sha256, sha256_concat};
pub use keys::{
    node_id_from_public_key, public_key_from_hex, sign_message, verify_signature, KeyError,
    KeyPair, NODE_ID_BYTES,
};
