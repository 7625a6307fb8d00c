//! Periodic reconciliation of the shared document
//!
//! Each tick plans the windows for the current time, builds the document,
//! and writes it with a compare-and-swap only when the content changed.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::replicas::{expand, InstanceIdentity};
use super::window_planner::{ShardWindow, WindowPlanner};
use crate::config::{OperatorConfig, ShardingPolicy};
use crate::document::{ConfigDocument, DocumentBuilder};
use crate::error::{Result, TimeshardError};
use crate::metrics::standard;
use crate::runtime::{RetryPolicy, ShutdownSignal};
use crate::store::{ConfigStore, StoredDocument};

/// Configuration for the reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// StatefulSet whose pods the document addresses
    pub statefulset_name: String,
    /// Time between ticks
    pub interval: Duration,
    /// Planning clock granularity in seconds
    pub granularity_secs: u64,
    /// Retry schedule for transient store failures within one tick
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            statefulset_name: "thanos-store".into(),
            interval: Duration::from_secs(300),
            granularity_secs: 3600,
            retry: RetryPolicy::default(),
        }
    }
}

impl ReconcilerConfig {
    /// Derive from the operator config file
    pub fn from_operator(config: &OperatorConfig) -> Self {
        let op = &config.operator;
        Self {
            statefulset_name: op.statefulset_name.clone(),
            interval: config.update_interval(),
            granularity_secs: op.time_granularity_secs,
            retry: RetryPolicy {
                max_attempts: op.write_retries.max(1),
                base_delay: Duration::from_millis(op.retry_base_delay_ms),
                ..RetryPolicy::default()
            },
        }
    }
}

/// Reconciler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    /// Waiting for the next tick
    Idle,
    /// Tick in progress
    Reconciling,
    /// Shutting down
    ShuttingDown,
}

/// Result of one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Stored content already matches; nothing written
    Unchanged { generation: u64 },
    /// New document committed
    Written { generation: u64, version: String },
    /// Another writer got there first; retried next tick
    Conflict,
    /// Store kept failing; retried next tick
    Deferred,
}

/// Single-writer reconciler
pub struct Reconciler {
    store: Arc<dyn ConfigStore>,
    planner: WindowPlanner,
    builder: DocumentBuilder,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    state: RwLock<ReconcilerState>,
}

impl Reconciler {
    /// Create a reconciler; an infeasible policy is rejected here
    pub fn new(
        store: Arc<dyn ConfigStore>,
        policy: ShardingPolicy,
        config: ReconcilerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let planner = WindowPlanner::new(policy, config.granularity_secs)?;
        let builder = DocumentBuilder::new(config.statefulset_name.clone(), policy);
        Ok(Self {
            store,
            planner,
            builder,
            clock,
            config,
            state: RwLock::new(ReconcilerState::Idle),
        })
    }

    /// Share static worker settings through the document
    pub fn with_worker_settings(mut self, settings: &serde_yaml::Mapping) -> Result<Self> {
        self.builder = self.builder.with_worker_settings(settings)?;
        Ok(self)
    }

    /// Get reconciler state
    pub async fn state(&self) -> ReconcilerState {
        *self.state.read().await
    }

    /// Run one reconciliation pass
    pub async fn tick(&self) -> Result<TickOutcome> {
        *self.state.write().await = ReconcilerState::Reconciling;
        let result = self.reconcile().await;
        let mut state = self.state.write().await;
        if *state == ReconcilerState::Reconciling {
            *state = ReconcilerState::Idle;
        }
        result
    }

    async fn reconcile(&self) -> Result<TickOutcome> {
        standard::RECONCILE_TICKS.inc();

        let windows = self.planner.plan(self.clock.now())?;
        let mapping = expand(&windows, self.planner.policy().replicas_per_shard)?;

        let retry = self.config.retry;
        for attempt in 0..retry.max_attempts {
            match self.try_write(&mapping).await {
                Ok(outcome) => return Ok(outcome),
                Err(TimeshardError::WriteConflict { name, expected, actual }) => {
                    standard::WRITE_CONFLICTS.inc();
                    info!(
                        "Lost write race on {} (held {:?}, now {:?}); retrying next tick",
                        name, expected, actual
                    );
                    return Ok(TickOutcome::Conflict);
                }
                Err(e) if e.is_retryable() => {
                    standard::TRANSIENT_ERRORS.inc();
                    warn!(
                        "Store attempt {}/{} failed: {}",
                        attempt + 1,
                        retry.max_attempts,
                        e
                    );
                    if attempt + 1 < retry.max_attempts {
                        tokio::time::sleep(retry.delay(attempt)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            "Store {} unavailable after {} attempts; deferring to next tick",
            self.store.name(),
            retry.max_attempts
        );
        Ok(TickOutcome::Deferred)
    }

    async fn try_write(
        &self,
        mapping: &BTreeMap<InstanceIdentity, ShardWindow>,
    ) -> Result<TickOutcome> {
        let stored = self.store.get().await?;
        let previous = stored.as_ref().and_then(|s| self.parse_previous(s));
        let mut document = self.builder.build(mapping, previous.as_ref())?;
        if previous.is_none() {
            let salvaged = stored
                .as_ref()
                .and_then(|s| ConfigDocument::salvage_generation(&s.body));
            if let Some(last) = salvaged.filter(|last| *last >= document.generation) {
                debug!("Continuing after generation {} of the unreadable document", last);
                document.advance_past(last);
            }
        }

        if let Some(prev) = &previous {
            if prev.content_hash == document.content_hash {
                debug!("Document generation {} is current", prev.generation);
                standard::DOCUMENT_GENERATION.set(prev.generation as i64);
                return Ok(TickOutcome::Unchanged {
                    generation: prev.generation,
                });
            }
        }

        let body = document.to_canonical_json()?;
        let expected = stored.as_ref().map(|s| s.version.as_str());
        let version = self.store.put_if_version(body, expected).await?;

        standard::DOCUMENT_WRITES.inc();
        standard::DOCUMENT_GENERATION.set(document.generation as i64);
        info!(
            "Wrote document generation {} to {} (version {})",
            document.generation,
            self.store.name(),
            version
        );

        Ok(TickOutcome::Written {
            generation: document.generation,
            version,
        })
    }

    /// Parse the stored document, treating unreadable content as absent
    ///
    /// The conditional write still carries the stored version, so a corrupt
    /// document is replaced without racing a concurrent writer. Its
    /// generation is kept monotonic when the `generation` field survived;
    /// otherwise numbering restarts at 1.
    fn parse_previous(&self, stored: &StoredDocument) -> Option<ConfigDocument> {
        if stored.body.trim().is_empty() {
            return None;
        }
        match ConfigDocument::from_json(&stored.body) {
            Ok(document) => Some(document),
            Err(e) => {
                warn!(
                    "Replacing unreadable document in {} (version {}): {}",
                    self.store.name(),
                    stored.version,
                    e
                );
                None
            }
        }
    }

    /// Tick on the configured interval until shutdown
    ///
    /// A tick in flight when shutdown arrives runs to completion.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<()> {
        info!(
            "Reconciler starting for {} every {:?}",
            self.config.statefulset_name, self.config.interval
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop = shutdown.subscribe();

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = ticker.tick() => {}
            }
            if shutdown.is_shutdown() {
                break;
            }

            match self.tick().await {
                Ok(outcome) => debug!("Tick finished: {:?}", outcome),
                Err(e) if e.is_fatal() => {
                    error!("Reconciler stopping: {}", e);
                    *self.state.write().await = ReconcilerState::ShuttingDown;
                    return Err(e);
                }
                Err(e) => error!("Reconciliation tick failed: {}", e),
            }
        }

        *self.state.write().await = ReconcilerState::ShuttingDown;
        info!("Reconciler stopped");
        Ok(())
    }
}
