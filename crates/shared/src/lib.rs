//! Typed IDs, the shared error type, and constants used by the crypto
//! engine and its consumers.

pub mod constants;
pub mod error;
pub mod ids;
