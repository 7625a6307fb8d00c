//! Shared configuration document
//!
//! The document is the single source of truth written by the reconciler and
//! read by every instance agent.

pub mod builder;

pub use builder::{ConfigDocument, DocumentBuilder, InstanceEntry};

use sha2::{Digest, Sha256};

/// Key under which the document is stored in the configuration record
pub const DOCUMENT_KEY: &str = "config.json";

/// Hex-encoded SHA-256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
