//! End-to-end encryption session engine for Murmur.
//!
//! Provides identity keypair generation, X3DH key agreement, Double Ratchet
//! message encryption, safety-number fingerprints, master-key recovery
//! phrases, and secure key storage backed by encrypted SQLite (SQLCipher).

pub mod directory;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod master_key;
pub mod message;
pub mod prekeys;
pub mod primitives;
pub mod rotation;
pub mod session;
pub mod storage;
