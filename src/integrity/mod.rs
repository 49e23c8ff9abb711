//! Integrity verification
//!
//! Merkle roots let two peers check agreement on their whole shard set
//! without moving payloads.

pub mod merkle;
mod verifier;

pub use verifier::{IntegrityError, IntegrityVerifier, SummaryDiff};
