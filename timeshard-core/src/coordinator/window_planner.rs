//! Deterministic time-window planning
//!
//! Splits the retention period into one window per shard. Shard 0 owns the
//! newest data and reaches into the future by the configured buffer; every
//! following shard steps back in time and shares `overlap_days` with its
//! newer neighbour.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ShardingPolicy;
use crate::document::sha256_hex;
use crate::error::{Result, TimeshardError};

/// Time range served by one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardWindow {
    pub shard_index: u32,
    pub min_time: DateTime<Utc>,
    pub max_time: DateTime<Utc>,
}

impl ShardWindow {
    /// Content fingerprint used for change detection
    ///
    /// Depends only on the shard and its bounds at second precision.
    pub fn fingerprint(&self) -> String {
        sha256_hex(
            format!(
                "{}:{}:{}",
                self.shard_index,
                self.min_time.timestamp(),
                self.max_time.timestamp()
            )
            .as_bytes(),
        )
    }
}

/// Truncate `now` down to a multiple of `granularity_secs`
///
/// Planning on a truncated clock keeps consecutive ticks inside the same
/// granule byte-identical.
pub fn truncate(now: DateTime<Utc>, granularity_secs: u64) -> DateTime<Utc> {
    if granularity_secs <= 1 {
        return DateTime::<Utc>::from_timestamp(now.timestamp(), 0).unwrap_or(now);
    }
    let granule = granularity_secs as i64;
    let secs = now.timestamp();
    DateTime::<Utc>::from_timestamp(secs - secs.rem_euclid(granule), 0).unwrap_or(now)
}

/// Shift `at` by `delta`, failing when either leaves chrono's range
fn shift(at: DateTime<Utc>, delta: Option<TimeDelta>) -> Result<DateTime<Utc>> {
    delta
        .and_then(|d| at.checked_add_signed(d))
        .ok_or_else(|| {
            TimeshardError::infeasible(format!("windows around {} fall outside the supported time range", at))
        })
}

/// Compute the window of every shard, ordered by shard index
pub fn plan(now: DateTime<Utc>, policy: &ShardingPolicy) -> Result<Vec<ShardWindow>> {
    policy.validate()?;

    let newest = shift(now, TimeDelta::try_hours(i64::from(policy.future_buffer_hours)))?;
    let floor = shift(now, TimeDelta::try_days(-i64::from(policy.retention_days)))?;

    if policy.total_shards == 1 {
        return Ok(vec![ShardWindow {
            shard_index: 0,
            min_time: floor,
            max_time: newest,
        }]);
    }

    let overlap = TimeDelta::try_days(i64::from(policy.overlap_days));
    let width = TimeDelta::try_days(-(i64::from(policy.span_days()) + i64::from(policy.overlap_days)));
    let last = policy.total_shards - 1;

    let mut windows = Vec::with_capacity(policy.total_shards as usize);
    let mut max_time = newest;
    for shard_index in 0..policy.total_shards {
        let mut min_time = shift(max_time, width)?;
        if shard_index == last {
            if min_time < floor {
                min_time = floor;
            }
            if min_time >= max_time {
                return Err(TimeshardError::infeasible(format!(
                    "shard {} would start at {} but must end at {}",
                    shard_index, min_time, max_time
                )));
            }
        }
        windows.push(ShardWindow {
            shard_index,
            min_time,
            max_time,
        });
        max_time = shift(min_time, overlap)?;
    }

    debug!(
        "Planned {} windows from {} down to {}",
        windows.len(),
        newest,
        windows.last().map(|w| w.min_time).unwrap_or(newest)
    );

    Ok(windows)
}

/// Policy-bound planner
pub struct WindowPlanner {
    policy: ShardingPolicy,
    granularity_secs: u64,
}

impl WindowPlanner {
    /// Create a planner; fails if the policy is infeasible
    pub fn new(policy: ShardingPolicy, granularity_secs: u64) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            granularity_secs,
        })
    }

    /// Plan windows for `now` after truncating it to the planner granularity
    pub fn plan(&self, now: DateTime<Utc>) -> Result<Vec<ShardWindow>> {
        plan(truncate(now, self.granularity_secs), &self.policy)
    }

    pub fn policy(&self) -> &ShardingPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn policy(total_shards: u32, retention_days: u32, overlap_days: u32) -> ShardingPolicy {
        ShardingPolicy {
            total_shards,
            replicas_per_shard: 1,
            retention_days,
            overlap_days,
            future_buffer_hours: 24,
        }
    }

    #[test]
    fn test_reference_layout() {
        let windows = plan(ts("2024-01-15T00:00:00Z"), &policy(3, 370, 1)).unwrap();
        assert_eq!(windows.len(), 3);

        assert_eq!(windows[0].max_time, ts("2024-01-16T00:00:00Z"));
        assert_eq!(windows[0].min_time, ts("2023-09-14T00:00:00Z"));
        assert_eq!(windows[1].max_time, ts("2023-09-15T00:00:00Z"));
        assert_eq!(windows[1].min_time, ts("2023-05-14T00:00:00Z"));
        assert_eq!(windows[2].max_time, ts("2023-05-15T00:00:00Z"));
        assert_eq!(windows[2].min_time, ts("2023-01-11T00:00:00Z"));
    }

    #[test]
    fn test_last_shard_clamped_to_retention_floor() {
        // 10 days over 3 shards: 3 days each plus 2 days of overlap, no buffer.
        let mut p = policy(3, 10, 2);
        p.future_buffer_hours = 0;
        let now = ts("2024-03-01T00:00:00Z");
        let windows = plan(now, &p).unwrap();
        assert_eq!(windows[2].max_time, now - Duration::days(6));
        assert_eq!(windows[2].min_time, now - Duration::days(10));
    }

    #[test]
    fn test_single_shard_covers_everything() {
        let now = ts("2024-01-15T00:00:00Z");
        let windows = plan(now, &policy(1, 30, 0)).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].min_time, now - Duration::days(30));
        assert_eq!(windows[0].max_time, now + Duration::hours(24));
    }

    #[test]
    fn test_infeasible_overlap() {
        let err = plan(ts("2024-01-15T00:00:00Z"), &policy(4, 40, 10)).unwrap_err();
        assert!(matches!(err, TimeshardError::PolicyInfeasible { .. }));
    }

    #[test]
    fn test_unrepresentable_range_is_infeasible() {
        let mut p = policy(1, 200_000_000, 0);
        assert!(matches!(
            plan(ts("2024-01-15T00:00:00Z"), &p),
            Err(TimeshardError::PolicyInfeasible { .. })
        ));

        p.retention_days = 30;
        p.future_buffer_hours = u32::MAX;
        assert!(matches!(
            plan(ts("2024-01-15T00:00:00Z"), &p),
            Err(TimeshardError::PolicyInfeasible { .. })
        ));

        let multi = policy(3, 200_000_000, 1);
        assert!(matches!(
            plan(ts("2024-01-15T00:00:00Z"), &multi),
            Err(TimeshardError::PolicyInfeasible { .. })
        ));
    }

    #[test]
    fn test_truncate() {
        let now = ts("2024-01-15T10:47:13Z");
        assert_eq!(truncate(now, 3600), ts("2024-01-15T10:00:00Z"));
        assert_eq!(truncate(now, 60), ts("2024-01-15T10:47:00Z"));
        assert_eq!(truncate(now, 0), now);
    }

    #[test]
    fn test_fingerprint_ignores_subsecond_noise() {
        let a = ShardWindow {
            shard_index: 1,
            min_time: ts("2024-01-01T00:00:00Z"),
            max_time: ts("2024-02-01T00:00:00Z"),
        };
        let b = ShardWindow {
            max_time: ts("2024-02-01T00:00:00.250Z"),
            ..a
        };
        let c = ShardWindow { shard_index: 2, ..a };
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_planner_granularity() {
        let planner = WindowPlanner::new(policy(3, 370, 1), 3600).unwrap();
        let a = planner.plan(ts("2024-01-15T10:05:00Z")).unwrap();
        let b = planner.plan(ts("2024-01-15T10:55:00Z")).unwrap();
        let c = planner.plan(ts("2024-01-15T11:00:00Z")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
