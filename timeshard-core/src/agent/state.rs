//! Agent state machine phases and locally applied state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

use super::render::write_atomically;
use crate::coordinator::ShardWindow;
use crate::error::{Result, TimeshardError};

/// Agent phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    /// Waiting for a document notification
    WatchingForChange,
    /// Comparing the extracted window with the applied one
    DetectedChange,
    /// Writing the worker config
    Rendering,
    /// Waiting for the worker to acknowledge a reload
    Reloading,
    /// New window confirmed by the worker
    Applied,
    /// Waiting before retrying a failed render or reload
    ErrorBackoff,
    /// Shutting down
    ShuttingDown,
}

/// Last window this instance successfully applied
///
/// Only written after the worker acknowledged the reload, so a crash
/// between render and acknowledgement replays the same window on restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedState {
    pub window: Option<ShardWindow>,
    pub fingerprint: Option<String>,
    /// Hash of the worker settings rendered alongside the window
    #[serde(default)]
    pub settings_hash: Option<String>,
    /// Document generation the window came from
    pub generation: u64,
    pub applied_at: Option<DateTime<Utc>>,
}

impl AppliedState {
    /// State after applying `window`
    pub fn applied(window: ShardWindow, settings_hash: String, generation: u64) -> Self {
        Self {
            fingerprint: Some(window.fingerprint()),
            window: Some(window),
            settings_hash: Some(settings_hash),
            generation,
            applied_at: Some(Utc::now()),
        }
    }

    /// Whether this instance already serves `fingerprint` with these settings
    pub fn matches(&self, fingerprint: &str, settings_hash: &str) -> bool {
        self.fingerprint.as_deref() == Some(fingerprint)
            && self.settings_hash.as_deref() == Some(settings_hash)
    }

    /// Load persisted state; absent or unreadable files yield empty state
    pub async fn load(path: &Path) -> Self {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No applied state at {}, starting empty", path.display());
                return Self::default();
            }
            Err(e) => {
                warn!("Cannot read applied state {}: {}", path.display(), e);
                return Self::default();
            }
        };

        match serde_json::from_str::<Self>(&raw) {
            Ok(state) if state.is_consistent() => state,
            Ok(_) => {
                warn!("Applied state {} has a stale fingerprint, ignoring", path.display());
                Self::default()
            }
            Err(e) => {
                warn!("Applied state {} is corrupt, ignoring: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Persist atomically
    pub async fn persist(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_vec_pretty(self).map_err(|e| TimeshardError::Internal {
            message: format!("cannot encode applied state: {}", e),
        })?;
        write_atomically(path, &body).await
    }

    fn is_consistent(&self) -> bool {
        match (&self.window, &self.fingerprint) {
            (Some(window), Some(fingerprint)) => window.fingerprint() == *fingerprint,
            (None, None) => true,
            _ => false,
        }
    }
}
