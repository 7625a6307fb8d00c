//! Replica expansion and instance identities
//!
//! A StatefulSet numbers its pods `0..total_shards * replicas_per_shard`.
//! Consecutive ordinals form one shard's replica group, so both sides can
//! derive an instance's shard from its ordinal alone.

use std::collections::BTreeMap;
use std::fmt;

use super::window_planner::ShardWindow;
use crate::error::{Result, TimeshardError};

/// Stable identity of one worker instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceIdentity {
    pub shard_index: u32,
    pub replica: u32,
}

impl InstanceIdentity {
    pub fn new(shard_index: u32, replica: u32) -> Self {
        Self { shard_index, replica }
    }

    /// Identity of the pod with the given StatefulSet ordinal
    pub fn from_ordinal(ordinal: u32, replicas_per_shard: u32) -> Result<Self> {
        if replicas_per_shard == 0 {
            return Err(TimeshardError::InvalidReplicaCount { replicas: 0 });
        }
        Ok(Self {
            shard_index: ordinal / replicas_per_shard,
            replica: ordinal % replicas_per_shard,
        })
    }

    /// StatefulSet ordinal of this instance; `None` if it overflows `u32`
    pub fn ordinal(&self, replicas_per_shard: u32) -> Option<u32> {
        self.shard_index
            .checked_mul(replicas_per_shard)?
            .checked_add(self.replica)
    }

    /// Pod name under the given StatefulSet
    pub fn pod_name(&self, statefulset: &str, replicas_per_shard: u32) -> Option<String> {
        self.ordinal(replicas_per_shard)
            .map(|ordinal| format!("{}-{}", statefulset, ordinal))
    }
}

impl fmt::Display for InstanceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}/replica-{}", self.shard_index, self.replica)
    }
}

/// Extract the trailing ordinal from a pod name such as `thanos-store-4`
pub fn parse_pod_ordinal(pod_name: &str) -> Option<u32> {
    let (_, suffix) = pod_name.rsplit_once('-')?;
    suffix.parse().ok()
}

/// Give every replica of every shard that shard's window
pub fn expand(
    windows: &[ShardWindow],
    replicas_per_shard: u32,
) -> Result<BTreeMap<InstanceIdentity, ShardWindow>> {
    if replicas_per_shard == 0 {
        return Err(TimeshardError::InvalidReplicaCount { replicas: 0 });
    }
    u32::try_from(windows.len())
        .ok()
        .and_then(|shards| shards.checked_mul(replicas_per_shard))
        .ok_or_else(|| {
            TimeshardError::infeasible(format!(
                "{} shards with {} replicas each exceed the ordinal range",
                windows.len(),
                replicas_per_shard
            ))
        })?;

    let mut mapping = BTreeMap::new();
    for window in windows {
        for replica in 0..replicas_per_shard {
            mapping.insert(InstanceIdentity::new(window.shard_index, replica), *window);
        }
    }
    Ok(mapping)
}

/// Window for a pod ordinal, mapping ordinals past the last shard onto it
pub fn window_for_ordinal(
    windows: &[ShardWindow],
    ordinal: u32,
    replicas_per_shard: u32,
) -> Result<Option<ShardWindow>> {
    let identity = InstanceIdentity::from_ordinal(ordinal, replicas_per_shard)?;
    let index = (identity.shard_index as usize).min(windows.len().saturating_sub(1));
    Ok(windows.get(index).copied())
}
