//! Error types for timeshard
//!
//! Taxonomy covering policy validation, the shared configuration record,
//! and the per-instance render/reload pipeline.

use thiserror::Error;

/// Primary error type for all timeshard operations
#[derive(Debug, Error)]
pub enum TimeshardError {
    // ========== Policy Errors ==========

    /// Sharding parameters cannot produce a valid set of windows
    #[error("Sharding policy infeasible: {reason}")]
    PolicyInfeasible { reason: String },

    /// Replica count must be at least one
    #[error("Invalid replica count: {replicas}")]
    InvalidReplicaCount { replicas: u32 },

    /// Configuration missing or malformed
    #[error("Invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    // ========== Store Errors ==========

    /// Conditional write lost against a concurrent writer
    #[error("Write conflict on {name}: expected version {expected:?}, found {actual:?}")]
    WriteConflict {
        name: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Store or API unreachable
    #[error("Transient I/O error: {message}")]
    TransientIo { message: String },

    /// Stored document could not be parsed
    #[error("Invalid config document: {reason}")]
    DocumentInvalid { reason: String },

    /// No entry for this instance in the document
    #[error("No window assigned to instance {identity}")]
    InstanceNotFound { identity: String },

    // ========== Agent Errors ==========

    /// Worker config could not be produced or written
    #[error("Render failed for {path}: {reason}")]
    RenderFailure { path: String, reason: String },

    /// Reload trigger could not be delivered
    #[error("Reload failed: {reason}")]
    ReloadFailed { reason: String },

    /// Worker did not acknowledge the reload in time
    #[error("Worker did not acknowledge reload within {timeout_secs}s")]
    ReloadTimeout { timeout_secs: u64 },

    // ========== Runtime Errors ==========

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TimeshardError {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TimeshardError::TransientIo { .. }
                | TimeshardError::RenderFailure { .. }
                | TimeshardError::ReloadFailed { .. }
                | TimeshardError::ReloadTimeout { .. }
        )
    }

    /// Returns true if this error must stop the process at startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TimeshardError::PolicyInfeasible { .. }
                | TimeshardError::InvalidReplicaCount { .. }
                | TimeshardError::ConfigInvalid { .. }
        )
    }

    pub(crate) fn infeasible(reason: impl Into<String>) -> Self {
        TimeshardError::PolicyInfeasible { reason: reason.into() }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        TimeshardError::ConfigInvalid { reason: reason.into() }
    }

    pub(crate) fn transient(message: impl Into<String>) -> Self {
        TimeshardError::TransientIo { message: message.into() }
    }
}

/// Result type alias for timeshard operations
pub type Result<T> = std::result::Result<T, TimeshardError>;
