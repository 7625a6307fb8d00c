//! Per-instance agent
//!
//! Watches the shared document, extracts this instance's window and applies
//! it to the co-located worker: render the config, trigger a reload, and
//! record the window as applied once the worker acknowledged it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use super::reload::ReloadTrigger;
use super::render::Renderer;
use super::state::{AgentPhase, AppliedState};
use crate::config::AgentSettings;
use crate::coordinator::{parse_pod_ordinal, window_for_ordinal, ShardWindow};
use crate::document::ConfigDocument;
use crate::error::{Result, TimeshardError};
use crate::metrics::standard;
use crate::runtime::{RetryPolicy, ShutdownSignal};
use crate::store::StoredDocument;

/// Configuration for one agent
#[derive(Debug, Clone)]
pub struct InstanceAgentConfig {
    pub pod_name: String,
    /// StatefulSet ordinal of this pod
    pub ordinal: u32,
    pub replicas_per_shard: u32,
    pub applied_state_path: PathBuf,
    pub reload_timeout: Duration,
    /// Backoff between failed render/reload attempts; `max_attempts` is
    /// the point after which failures are logged as errors
    pub backoff: RetryPolicy,
}

impl InstanceAgentConfig {
    /// Derive from environment settings
    ///
    /// Pod names without a numeric suffix are treated as ordinal 0.
    pub fn from_settings(settings: &AgentSettings) -> Self {
        let ordinal = parse_pod_ordinal(&settings.pod_name).unwrap_or_else(|| {
            warn!(
                "Cannot derive ordinal from pod name {:?}, assuming 0",
                settings.pod_name
            );
            0
        });
        Self {
            pod_name: settings.pod_name.clone(),
            ordinal,
            replicas_per_shard: settings.replicas_per_shard,
            applied_state_path: settings.applied_state_path.clone(),
            reload_timeout: settings.reload_timeout,
            backoff: RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
            },
        }
    }
}

/// Result of handling one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Window and settings already applied
    Unchanged,
    /// New window rendered and acknowledged by the worker
    Applied { generation: u64 },
}

/// Counters for one agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentStats {
    pub renders: u64,
    pub reloads: u64,
    pub unchanged: u64,
}

/// Instance agent
pub struct InstanceAgent {
    config: InstanceAgentConfig,
    renderer: Renderer,
    reloader: Arc<dyn ReloadTrigger>,
    applied: RwLock<AppliedState>,
    phase: RwLock<AgentPhase>,
    renders: AtomicU64,
    reloads: AtomicU64,
    unchanged: AtomicU64,
}

impl InstanceAgent {
    /// Create an agent, restoring the last applied state from disk
    pub async fn open(
        config: InstanceAgentConfig,
        renderer: Renderer,
        reloader: Arc<dyn ReloadTrigger>,
    ) -> Self {
        let applied = AppliedState::load(&config.applied_state_path).await;
        if let Some(window) = &applied.window {
            info!(
                "{} last applied shard {} at generation {}",
                config.pod_name, window.shard_index, applied.generation
            );
        }
        Self {
            config,
            renderer,
            reloader,
            applied: RwLock::new(applied),
            phase: RwLock::new(AgentPhase::WatchingForChange),
            renders: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
            unchanged: AtomicU64::new(0),
        }
    }

    pub async fn phase(&self) -> AgentPhase {
        *self.phase.read().await
    }

    async fn set_phase(&self, phase: AgentPhase) {
        *self.phase.write().await = phase;
    }

    /// Last applied state
    pub async fn applied(&self) -> AppliedState {
        self.applied.read().await.clone()
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            renders: self.renders.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
        }
    }

    /// This instance's window in `document`, with the generation it came from
    fn extract(&self, document: &ConfigDocument) -> Result<(ShardWindow, u64)> {
        if let Some(entry) = document.entry_for(&self.config.pod_name, Some(self.config.ordinal)) {
            return Ok((entry.window(), entry.generation));
        }

        // Pods beyond the planned instance count serve the oldest shard
        let windows: Vec<ShardWindow> = document
            .instances
            .values()
            .map(|entry| (entry.shard_index, entry.window()))
            .collect::<BTreeMap<_, _>>()
            .into_values()
            .collect();
        let replicas = document.policy.replicas_per_shard;
        if replicas != self.config.replicas_per_shard {
            warn!(
                "REPLICAS_PER_SHARD={} disagrees with the document ({}), following the document",
                self.config.replicas_per_shard, replicas
            );
        }
        let window = window_for_ordinal(&windows, self.config.ordinal, replicas)?
            .ok_or_else(|| TimeshardError::InstanceNotFound {
                identity: self.config.pod_name.clone(),
            })?;
        debug!(
            "{} not addressed by the document, using shard {}",
            self.config.pod_name, window.shard_index
        );
        Ok((window, document.generation))
    }

    /// Apply one document notification, without retrying
    pub async fn handle(&self, stored: &StoredDocument) -> Result<HandleOutcome> {
        self.set_phase(AgentPhase::DetectedChange).await;
        let document = ConfigDocument::from_json(&stored.body)?;
        let (window, generation) = self.extract(&document)?;
        let fingerprint = window.fingerprint();
        let settings_hash = document.settings_hash();

        if self.applied.read().await.matches(&fingerprint, &settings_hash) {
            debug!(
                "{} already serves shard {} (generation {})",
                self.config.pod_name, window.shard_index, generation
            );
            self.unchanged.fetch_add(1, Ordering::Relaxed);
            self.set_phase(AgentPhase::WatchingForChange).await;
            return Ok(HandleOutcome::Unchanged);
        }

        self.set_phase(AgentPhase::Rendering).await;
        self.renders.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.renderer.render(&window, &document.worker_settings).await {
            standard::RENDER_FAILURES.inc();
            return Err(e);
        }

        self.set_phase(AgentPhase::Reloading).await;
        self.reloads.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        if let Err(e) = self.reloader.reload(self.config.reload_timeout).await {
            if matches!(e, TimeshardError::ReloadTimeout { .. }) {
                standard::RELOAD_TIMEOUTS.inc();
            }
            return Err(e);
        }
        standard::RELOAD_DURATION.observe_since(start);
        standard::RELOADS_APPLIED.inc();

        let state = AppliedState::applied(window, settings_hash, generation);
        if let Err(e) = state.persist(&self.config.applied_state_path).await {
            // The worker already runs the new window; a restart re-applies it
            warn!("Cannot persist applied state: {}", e);
        }
        *self.applied.write().await = state;
        self.set_phase(AgentPhase::Applied).await;

        info!(
            "{} applied shard {} window {} .. {} (generation {})",
            self.config.pod_name, window.shard_index, window.min_time, window.max_time, generation
        );
        Ok(HandleOutcome::Applied { generation })
    }

    /// Apply `stored`, backing off on retryable failures
    ///
    /// Gives up early when a newer document arrives or shutdown is requested.
    /// Returns true if a newer document is waiting.
    async fn apply(
        &self,
        stored: &StoredDocument,
        rx: &mut watch::Receiver<Option<StoredDocument>>,
        shutdown: &ShutdownSignal,
    ) -> bool {
        let backoff = self.config.backoff;
        let mut attempt = 0u32;
        loop {
            match self.handle(stored).await {
                Ok(outcome) => {
                    debug!("Document version {} handled: {:?}", stored.version, outcome);
                    return false;
                }
                Err(e) if e.is_retryable() => {
                    self.set_phase(AgentPhase::ErrorBackoff).await;
                    let delay = backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    if attempt >= backoff.max_attempts {
                        error!("Apply attempt {} failed: {}; retrying in {:?}", attempt, e, delay);
                    } else {
                        warn!("Apply attempt {} failed: {}; retrying in {:?}", attempt, e, delay);
                    }

                    tokio::select! {
                        _ = shutdown.wait() => return false,
                        changed = rx.changed() => {
                            if changed.is_ok() {
                                debug!("Document superseded during backoff");
                            }
                            return changed.is_ok();
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!("Ignoring document version {}: {}", stored.version, e);
                    return false;
                }
            }
        }
    }

    /// Follow document notifications until shutdown or the source closes
    pub async fn run(
        &self,
        mut rx: watch::Receiver<Option<StoredDocument>>,
        shutdown: ShutdownSignal,
    ) -> Result<()> {
        info!(
            "Agent {} (ordinal {}) watching for window changes",
            self.config.pod_name, self.config.ordinal
        );

        loop {
            let current = rx.borrow_and_update().clone();
            let superseded = match current {
                Some(stored) => self.apply(&stored, &mut rx, &shutdown).await,
                None => false,
            };
            if shutdown.is_shutdown() {
                break;
            }
            if superseded {
                continue;
            }

            self.set_phase(AgentPhase::WatchingForChange).await;
            tokio::select! {
                _ = shutdown.wait() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        warn!("Document source closed");
                        break;
                    }
                }
            }
        }

        self.set_phase(AgentPhase::ShuttingDown).await;
        info!("Agent {} stopped", self.config.pod_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::reload::ScriptedReloader;
    use crate::config::ShardingPolicy;
    use crate::coordinator::{expand, plan};
    use crate::document::DocumentBuilder;

    fn policy() -> ShardingPolicy {
        ShardingPolicy {
            total_shards: 3,
            replicas_per_shard: 2,
            retention_days: 370,
            overlap_days: 1,
            future_buffer_hours: 24,
        }
    }

    fn stored(now: &str, version: &str) -> StoredDocument {
        let windows = plan(now.parse().unwrap(), &policy()).unwrap();
        let mapping = expand(&windows, 2).unwrap();
        let document = DocumentBuilder::new("thanos-store", policy())
            .build(&mapping, None)
            .unwrap();
        StoredDocument {
            body: document.to_canonical_json().unwrap(),
            version: version.into(),
        }
    }

    fn config(dir: &std::path::Path, pod: &str) -> InstanceAgentConfig {
        config_with_replicas(dir, pod, "2")
    }

    fn config_with_replicas(dir: &std::path::Path, pod: &str, replicas: &str) -> InstanceAgentConfig {
        let settings = AgentSettings::from_lookup(|key| match key {
            "POD_NAME" => Some(pod.to_string()),
            "REPLICAS_PER_SHARD" => Some(replicas.to_string()),
            "WORKER_CONFIG_PATH" => Some(dir.join("config.yaml").display().to_string()),
            _ => None,
        })
        .unwrap();
        InstanceAgentConfig::from_settings(&settings)
    }

    async fn agent(dir: &std::path::Path, pod: &str) -> (Arc<ScriptedReloader>, InstanceAgent) {
        let reloader = Arc::new(ScriptedReloader::new());
        let agent = InstanceAgent::open(
            config(dir, pod),
            Renderer::new(dir.join("config.yaml")),
            reloader.clone(),
        )
        .await;
        (reloader, agent)
    }

    #[tokio::test]
    async fn test_apply_then_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (reloader, agent) = agent(dir.path(), "thanos-store-2").await;

        let doc = stored("2024-01-15T00:00:00Z", "1");
        assert_eq!(agent.handle(&doc).await.unwrap(), HandleOutcome::Applied { generation: 1 });
        assert_eq!(agent.applied().await.window.unwrap().shard_index, 1);
        assert_eq!(agent.phase().await, AgentPhase::Applied);

        assert_eq!(agent.handle(&doc).await.unwrap(), HandleOutcome::Unchanged);
        assert_eq!(reloader.calls(), 1);
        assert_eq!(agent.stats(), AgentStats { renders: 1, reloads: 1, unchanged: 1 });
    }

    #[tokio::test]
    async fn test_failed_reload_does_not_advance_state() {
        let dir = tempfile::tempdir().unwrap();
        let (reloader, agent) = agent(dir.path(), "thanos-store-0").await;
        reloader.push(Err(TimeshardError::ReloadTimeout { timeout_secs: 30 }));

        let doc = stored("2024-01-15T00:00:00Z", "1");
        assert!(agent.handle(&doc).await.is_err());
        assert_eq!(agent.applied().await, AppliedState::default());
        assert!(!config(dir.path(), "thanos-store-0").applied_state_path.exists());

        assert!(agent.handle(&doc).await.is_ok());
        assert_eq!(reloader.calls(), 2);
    }

    #[tokio::test]
    async fn test_unaddressed_pod_serves_last_shard() {
        let dir = tempfile::tempdir().unwrap();
        let (_, agent) = agent(dir.path(), "thanos-store-8").await;
        agent.handle(&stored("2024-01-15T00:00:00Z", "1")).await.unwrap();
        assert_eq!(agent.applied().await.window.unwrap().shard_index, 2);
    }

    #[tokio::test]
    async fn test_unaddressed_pod_uses_document_replicas() {
        let dir = tempfile::tempdir().unwrap();
        // With 4 replicas per shard ordinal 6 would be shard 1; the document says 2
        let agent = InstanceAgent::open(
            config_with_replicas(dir.path(), "thanos-store-6", "4"),
            Renderer::new(dir.path().join("config.yaml")),
            Arc::new(ScriptedReloader::new()),
        )
        .await;
        agent.handle(&stored("2024-01-15T00:00:00Z", "1")).await.unwrap();
        assert_eq!(agent.applied().await.window.unwrap().shard_index, 2);
    }

    #[tokio::test]
    async fn test_invalid_document_is_not_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let (reloader, agent) = agent(dir.path(), "thanos-store-0").await;
        let bad = StoredDocument {
            body: "{}".into(),
            version: "1".into(),
        };
        let err = agent.handle(&bad).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(reloader.calls(), 0);
    }
}
