//! Shared configuration record
//!
//! The record is an opaque versioned document with compare-and-swap writes
//! and change notification. Backends: in-memory (tests, single process),
//! a polled mounted file (agents), and a Kubernetes ConfigMap.

pub mod memory;
pub mod mounted;
#[cfg(feature = "kubernetes")]
pub mod configmap;

pub use memory::MemoryStore;
pub use mounted::MountedDocument;
#[cfg(feature = "kubernetes")]
pub use configmap::ConfigMapStore;

use async_trait::async_trait;

use crate::error::Result;

/// Document body together with its concurrency token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    /// Raw document text; empty if the record exists without a document
    pub body: String,
    /// Opaque version token for conditional writes
    pub version: String,
}

/// Read/compare-and-swap access to the shared record
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Name of the record, for logs
    fn name(&self) -> &str;

    /// Current document and version, `None` if the record does not exist
    async fn get(&self) -> Result<Option<StoredDocument>>;

    /// Write `body` only if the record is still at `expected`
    ///
    /// `expected = None` creates the record and fails if it already exists.
    /// A lost race yields `TimeshardError::WriteConflict`. Returns the new
    /// version token.
    async fn put_if_version(&self, body: String, expected: Option<&str>) -> Result<String>;
}
