//! Canonical document construction
//!
//! Serialization is stable: entries live in a `BTreeMap` and struct fields
//! serialize in declaration order, so identical input always yields
//! identical bytes and the content hash is meaningful.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use super::sha256_hex;
use crate::config::ShardingPolicy;
use crate::coordinator::replicas::InstanceIdentity;
use crate::coordinator::window_planner::ShardWindow;
use crate::error::{Result, TimeshardError};

/// Window assignment of one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEntry {
    pub shard_index: u32,
    pub replica: u32,
    pub ordinal: u32,
    pub min_time: DateTime<Utc>,
    pub max_time: DateTime<Utc>,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    /// Generation at which this entry's window last changed
    pub generation: u64,
    /// Fingerprint of the window
    pub content_hash: String,
}

impl InstanceEntry {
    fn new(identity: InstanceIdentity, window: &ShardWindow, ordinal: u32, generation: u64) -> Self {
        Self {
            shard_index: identity.shard_index,
            replica: identity.replica,
            ordinal,
            min_time: window.min_time,
            max_time: window.max_time,
            min_timestamp: window.min_time.timestamp(),
            max_timestamp: window.max_time.timestamp(),
            generation,
            content_hash: window.fingerprint(),
        }
    }

    /// The window this entry assigns
    pub fn window(&self) -> ShardWindow {
        ShardWindow {
            shard_index: self.shard_index,
            min_time: self.min_time,
            max_time: self.max_time,
        }
    }
}

/// Versioned snapshot of every instance's window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDocument {
    /// Document schema version
    pub version: u32,
    /// Incremented whenever `content_hash` changes
    pub generation: u64,
    pub content_hash: String,
    pub policy: ShardingPolicy,
    /// Static worker settings merged into every rendered config
    #[serde(default)]
    pub worker_settings: serde_json::Value,
    /// Entries keyed by pod name
    pub instances: BTreeMap<String, InstanceEntry>,
}

impl ConfigDocument {
    /// Current schema version
    pub const CURRENT_VERSION: u32 = 1;

    /// Serialize to the canonical stored form
    pub fn to_canonical_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| TimeshardError::DocumentInvalid {
            reason: format!("Serialization failed: {}", e),
        })
    }

    /// Parse and validate a stored document
    pub fn from_json(json: &str) -> Result<Self> {
        let document: Self = serde_json::from_str(json).map_err(|e| TimeshardError::DocumentInvalid {
            reason: format!("Deserialization failed: {}", e),
        })?;

        if document.version > Self::CURRENT_VERSION {
            return Err(TimeshardError::DocumentInvalid {
                reason: format!(
                    "Document version {} is newer than supported {}",
                    document.version,
                    Self::CURRENT_VERSION
                ),
            });
        }

        document.validate()?;
        Ok(document)
    }

    /// Check entry bounds and the content hash
    pub fn validate(&self) -> Result<()> {
        for (name, entry) in &self.instances {
            if entry.min_time >= entry.max_time {
                return Err(TimeshardError::DocumentInvalid {
                    reason: format!("{} has an empty window", name),
                });
            }
            if entry.content_hash != entry.window().fingerprint() {
                return Err(TimeshardError::DocumentInvalid {
                    reason: format!("{} fingerprint does not match its window", name),
                });
            }
        }

        let expected = content_hash(&self.policy, &self.worker_settings, &self.instances);
        if self.content_hash != expected {
            return Err(TimeshardError::DocumentInvalid {
                reason: format!("content hash {} does not match {}", self.content_hash, expected),
            });
        }
        Ok(())
    }

    /// Look up an instance by pod name, falling back to its ordinal
    pub fn entry_for(&self, pod_name: &str, ordinal: Option<u32>) -> Option<&InstanceEntry> {
        self.instances.get(pod_name).or_else(|| {
            let ordinal = ordinal?;
            self.instances.values().find(|entry| entry.ordinal == ordinal)
        })
    }

    /// Generation field of a document that no longer parses, if it survived
    pub fn salvage_generation(json: &str) -> Option<u64> {
        serde_json::from_str::<serde_json::Value>(json)
            .ok()?
            .get("generation")?
            .as_u64()
    }

    /// Renumber this document and every entry to follow `generation`
    pub fn advance_past(&mut self, generation: u64) {
        self.generation = generation.saturating_add(1);
        for entry in self.instances.values_mut() {
            entry.generation = self.generation;
        }
    }

    /// Hash of the worker settings alone
    pub fn settings_hash(&self) -> String {
        sha256_hex(self.worker_settings.to_string().as_bytes())
    }
}

/// Hash over the policy, the worker settings and every entry's window
/// fingerprint
///
/// Generations are excluded so that re-planning identical windows never
/// looks like a change.
fn content_hash(
    policy: &ShardingPolicy,
    worker_settings: &serde_json::Value,
    instances: &BTreeMap<String, InstanceEntry>,
) -> String {
    let mut canonical = format!(
        "policy:{}:{}:{}:{}:{}\nsettings:{}\n",
        policy.total_shards,
        policy.replicas_per_shard,
        policy.retention_days,
        policy.overlap_days,
        policy.future_buffer_hours,
        worker_settings
    );
    for (name, entry) in instances {
        canonical.push_str(name);
        canonical.push('=');
        canonical.push_str(&entry.content_hash);
        canonical.push('\n');
    }
    sha256_hex(canonical.as_bytes())
}

/// Builds documents for one StatefulSet
pub struct DocumentBuilder {
    statefulset: String,
    policy: ShardingPolicy,
    worker_settings: serde_json::Value,
}

impl DocumentBuilder {
    pub fn new(statefulset: impl Into<String>, policy: ShardingPolicy) -> Self {
        Self {
            statefulset: statefulset.into(),
            policy,
            worker_settings: serde_json::Value::Null,
        }
    }

    /// Carry static worker settings in every document
    ///
    /// The operator's YAML `thanos` section is converted here; non-string
    /// keys cannot be represented and are rejected.
    pub fn with_worker_settings(mut self, settings: &serde_yaml::Mapping) -> Result<Self> {
        self.worker_settings = if settings.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::to_value(settings).map_err(|e| TimeshardError::ConfigInvalid {
                reason: format!("thanos section cannot be shared: {}", e),
            })?
        };
        Ok(self)
    }

    /// Build the document for `mapping`
    ///
    /// The generation advances past `previous` only if the content differs.
    pub fn build(
        &self,
        mapping: &BTreeMap<InstanceIdentity, ShardWindow>,
        previous: Option<&ConfigDocument>,
    ) -> Result<ConfigDocument> {
        let replicas = self.policy.replicas_per_shard;

        let mut instances = BTreeMap::new();
        for (identity, window) in mapping {
            let (Some(ordinal), Some(name)) = (
                identity.ordinal(replicas),
                identity.pod_name(&self.statefulset, replicas),
            ) else {
                return Err(TimeshardError::infeasible(format!(
                    "{} has no ordinal with {} replicas",
                    identity, replicas
                )));
            };
            instances.insert(name, InstanceEntry::new(*identity, window, ordinal, 0));
        }

        let hash = content_hash(&self.policy, &self.worker_settings, &instances);
        let generation = match previous {
            None => 1,
            Some(prev) if prev.content_hash == hash => prev.generation,
            Some(prev) => prev.generation + 1,
        };

        for (name, entry) in instances.iter_mut() {
            entry.generation = previous
                .and_then(|prev| prev.instances.get(name))
                .filter(|old| old.content_hash == entry.content_hash)
                .map(|old| old.generation)
                .unwrap_or(generation);
        }

        debug!(
            "Built document generation {} with {} instances (hash {})",
            generation,
            instances.len(),
            &hash[..12]
        );

        Ok(ConfigDocument {
            version: ConfigDocument::CURRENT_VERSION,
            generation,
            content_hash: hash,
            policy: self.policy,
            worker_settings: self.worker_settings.clone(),
            instances,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::replicas::expand;
    use crate::coordinator::window_planner::plan;

    fn policy() -> ShardingPolicy {
        ShardingPolicy {
            total_shards: 3,
            replicas_per_shard: 2,
            retention_days: 370,
            overlap_days: 1,
            future_buffer_hours: 24,
        }
    }

    fn mapping(now: &str) -> BTreeMap<InstanceIdentity, ShardWindow> {
        let windows = plan(now.parse().unwrap(), &policy()).unwrap();
        expand(&windows, 2).unwrap()
    }

    #[test]
    fn test_document_roundtrip() {
        let builder = DocumentBuilder::new("thanos-store", policy());
        let document = builder.build(&mapping("2024-01-15T00:00:00Z"), None).unwrap();

        let json = document.to_canonical_json().unwrap();
        let restored = ConfigDocument::from_json(&json).unwrap();

        assert_eq!(restored, document);
        assert_eq!(restored.to_canonical_json().unwrap(), json);
        assert_eq!(restored.generation, 1);
        assert_eq!(restored.instances.len(), 6);
    }

    #[test]
    fn test_generation_only_moves_on_change() {
        let builder = DocumentBuilder::new("thanos-store", policy());
        let first = builder.build(&mapping("2024-01-15T00:00:00Z"), None).unwrap();
        let same = builder.build(&mapping("2024-01-15T00:00:00Z"), Some(&first)).unwrap();
        assert_eq!(same, first);

        let next = builder.build(&mapping("2024-01-16T00:00:00Z"), Some(&first)).unwrap();
        assert_eq!(next.generation, 2);
        assert_ne!(next.content_hash, first.content_hash);
        assert!(next.instances.values().all(|e| e.generation == 2));
    }

    #[test]
    fn test_entry_lookup_falls_back_to_ordinal() {
        let builder = DocumentBuilder::new("thanos-store", policy());
        let document = builder.build(&mapping("2024-01-15T00:00:00Z"), None).unwrap();

        let by_name = document.entry_for("thanos-store-3", None).unwrap();
        assert_eq!((by_name.shard_index, by_name.replica), (1, 1));

        let by_ordinal = document.entry_for("renamed-store-3", Some(3)).unwrap();
        assert_eq!(by_ordinal, by_name);
        assert!(document.entry_for("renamed-store-9", Some(9)).is_none());
    }

    #[test]
    fn test_tampered_document_rejected() {
        let builder = DocumentBuilder::new("thanos-store", policy());
        let mut document = builder.build(&mapping("2024-01-15T00:00:00Z"), None).unwrap();
        if let Some(entry) = document.instances.get_mut("thanos-store-0") {
            entry.max_time = entry.max_time + chrono::Duration::days(1);
        }
        let json = serde_json::to_string(&document).unwrap();
        assert!(matches!(
            ConfigDocument::from_json(&json),
            Err(TimeshardError::DocumentInvalid { .. })
        ));
    }

    #[test]
    fn test_worker_settings_change_content() {
        let plain = DocumentBuilder::new("thanos-store", policy());
        let mut settings = serde_yaml::Mapping::new();
        settings.insert("data_dir".into(), "/data".into());
        let with_settings = DocumentBuilder::new("thanos-store", policy())
            .with_worker_settings(&settings)
            .unwrap();

        let a = plain.build(&mapping("2024-01-15T00:00:00Z"), None).unwrap();
        let b = with_settings.build(&mapping("2024-01-15T00:00:00Z"), Some(&a)).unwrap();
        assert_ne!(a.content_hash, b.content_hash);
        assert_eq!(b.generation, 2);
        assert_eq!(b.worker_settings["data_dir"], "/data");

        let json = b.to_canonical_json().unwrap();
        assert_eq!(ConfigDocument::from_json(&json).unwrap(), b);
    }

    #[test]
    fn test_salvage_generation() {
        assert_eq!(ConfigDocument::salvage_generation(r#"{"generation": 7, "instances": 3}"#), Some(7));
        assert_eq!(ConfigDocument::salvage_generation(r#"{"generation": "7"}"#), None);
        assert_eq!(ConfigDocument::salvage_generation("{not json"), None);

        let builder = DocumentBuilder::new("thanos-store", policy());
        let mut document = builder.build(&mapping("2024-01-15T00:00:00Z"), None).unwrap();
        document.advance_past(7);
        assert_eq!(document.generation, 8);
        assert!(document.instances.values().all(|e| e.generation == 8));
        document.validate().unwrap();
    }

    #[test]
    fn test_newer_version_rejected() {
        let builder = DocumentBuilder::new("thanos-store", policy());
        let mut document = builder.build(&mapping("2024-01-15T00:00:00Z"), None).unwrap();
        document.version = ConfigDocument::CURRENT_VERSION + 1;
        let json = document.to_canonical_json().unwrap();
        assert!(ConfigDocument::from_json(&json).is_err());
    }
}
