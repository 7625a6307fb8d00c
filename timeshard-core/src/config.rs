//! Operator and agent configuration
//!
//! The operator reads a single YAML file at startup with `operator`,
//! `sharding` and `thanos` sections. The agent is configured from its
//! container environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TimeshardError};

/// Default config path inside the operator container
pub const DEFAULT_OPERATOR_CONFIG_PATH: &str = "/app/config/config.yaml";

/// Immutable sharding parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingPolicy {
    pub total_shards: u32,
    pub replicas_per_shard: u32,
    #[serde(rename = "data_retention_days")]
    pub retention_days: u32,
    #[serde(rename = "shard_overlap_days")]
    pub overlap_days: u32,
    pub future_buffer_hours: u32,
}

impl ShardingPolicy {
    /// Check the policy invariants
    pub fn validate(&self) -> Result<()> {
        if self.total_shards == 0 {
            return Err(TimeshardError::infeasible("total_shards must be at least 1"));
        }
        if self.replicas_per_shard == 0 {
            return Err(TimeshardError::InvalidReplicaCount {
                replicas: self.replicas_per_shard,
            });
        }
        if self.retention_days < self.total_shards {
            return Err(TimeshardError::infeasible(format!(
                "data_retention_days ({}) leaves less than one day per shard across {} shards",
                self.retention_days, self.total_shards
            )));
        }
        if self.overlap_days >= self.span_days() {
            return Err(TimeshardError::infeasible(format!(
                "shard_overlap_days ({}) must be smaller than the per-shard span ({} days)",
                self.overlap_days,
                self.span_days()
            )));
        }
        if self.instance_count().is_none() {
            return Err(TimeshardError::infeasible(format!(
                "{} shards with {} replicas each exceed the ordinal range",
                self.total_shards, self.replicas_per_shard
            )));
        }
        Ok(())
    }

    /// Days of retention owned by each shard, excluding overlap
    pub fn span_days(&self) -> u32 {
        self.retention_days / self.total_shards.max(1)
    }

    /// Number of addressable worker instances; `None` if it overflows `u32`
    pub fn instance_count(&self) -> Option<u32> {
        self.total_shards.checked_mul(self.replicas_per_shard)
    }
}

/// `operator` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorSection {
    pub namespace: String,
    pub statefulset_name: String,
    pub configmap_name: String,
    /// Seconds between reconciliation ticks
    pub update_interval: u64,
    /// Planning clock granularity in seconds
    #[serde(default = "default_granularity")]
    pub time_granularity_secs: u64,
    /// Attempts per tick for transient write failures
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_granularity() -> u64 {
    crate::DEFAULT_TIME_GRANULARITY_SECS
}

fn default_write_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

/// Full operator configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub operator: OperatorSection,
    pub sharding: ShardingPolicy,
    /// Static worker settings merged into every rendered config
    #[serde(default)]
    pub thanos: serde_yaml::Mapping,
}

impl OperatorConfig {
    /// Load and validate from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TimeshardError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&raw)?;
        tracing::info!("Loaded operator config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate YAML text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(TimeshardError::config("config file is empty"));
        }
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| TimeshardError::config(format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let op = &self.operator;
        if op.namespace.is_empty() || op.statefulset_name.is_empty() || op.configmap_name.is_empty() {
            return Err(TimeshardError::config(
                "namespace, statefulset_name and configmap_name must be non-empty",
            ));
        }
        if op.update_interval == 0 {
            return Err(TimeshardError::config("update_interval must be positive"));
        }
        if op.time_granularity_secs == 0 {
            return Err(TimeshardError::config("time_granularity_secs must be positive"));
        }
        self.sharding.validate()
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.operator.update_interval)
    }
}

/// Per-instance agent settings
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// StatefulSet pod name of this instance
    pub pod_name: String,
    pub replicas_per_shard: u32,
    /// Mounted shared document
    pub document_path: PathBuf,
    /// Watch this ConfigMap through the API server instead of the mounted file
    pub document_configmap: Option<String>,
    pub namespace: String,
    /// Worker config file consumed by the store process
    pub worker_config_path: PathBuf,
    pub applied_state_path: PathBuf,
    /// Substring matched against `/proc/<pid>/cmdline`
    pub process_pattern: String,
    /// Readiness URL polled after a reload
    pub ready_url: Option<String>,
    pub reload_timeout: Duration,
    pub poll_interval: Duration,
}

impl AgentSettings {
    /// Read settings from the environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pod_name = lookup("POD_NAME")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| TimeshardError::config("POD_NAME is required"))?;
        let replicas_per_shard = parse_num(&lookup, "REPLICAS_PER_SHARD")?
            .ok_or_else(|| TimeshardError::config("REPLICAS_PER_SHARD is required"))?;
        if replicas_per_shard == 0 {
            return Err(TimeshardError::InvalidReplicaCount { replicas: 0 });
        }
        let worker_config_path = PathBuf::from(
            lookup("WORKER_CONFIG_PATH").unwrap_or_else(|| "/etc/thanos/config.yaml".into()),
        );
        let applied_state_path = lookup("APPLIED_STATE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| worker_config_path.with_extension("applied.json"));

        Ok(Self {
            pod_name,
            replicas_per_shard: replicas_per_shard as u32,
            document_path: PathBuf::from(
                lookup("DOCUMENT_PATH").unwrap_or_else(|| "/etc/thanos-operator/config.json".into()),
            ),
            document_configmap: lookup("DOCUMENT_CONFIGMAP").filter(|v| !v.is_empty()),
            namespace: lookup("POD_NAMESPACE")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "default".into()),
            worker_config_path,
            applied_state_path,
            process_pattern: lookup("WORKER_PROCESS_PATTERN")
                .unwrap_or_else(|| "thanos store".into()),
            ready_url: lookup("WORKER_READY_URL").filter(|v| !v.is_empty()),
            reload_timeout: Duration::from_secs(
                parse_num(&lookup, "RELOAD_TIMEOUT_SECS")?.unwrap_or(30),
            ),
            poll_interval: Duration::from_secs(
                parse_num(&lookup, "POLL_INTERVAL_SECS")?.unwrap_or(30).max(1),
            ),
        })
    }
}

fn parse_num<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| TimeshardError::config(format!("{} must be an unsigned integer, got {:?}", key, v))),
    }
}
