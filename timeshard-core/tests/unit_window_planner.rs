//! Unit tests for window planning
//!
//! Tests contiguity across many policies, determinism, and the reference
//! layout for a three-shard fleet.

use chrono::{DateTime, Duration, Utc};
use timeshard_core::config::ShardingPolicy;
use timeshard_core::coordinator::{expand, plan, WindowPlanner};
use timeshard_core::TimeshardError;

fn at(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn policies() -> Vec<ShardingPolicy> {
    let mut out = Vec::new();
    for total_shards in 1..=6 {
        for retention_days in [30, 90, 370, 730] {
            for overlap_days in 0..3 {
                for future_buffer_hours in [0, 24, 72] {
                    let policy = ShardingPolicy {
                        total_shards,
                        replicas_per_shard: 2,
                        retention_days,
                        overlap_days,
                        future_buffer_hours,
                    };
                    if policy.validate().is_ok() {
                        out.push(policy);
                    }
                }
            }
        }
    }
    out
}

#[test]
fn test_windows_are_contiguous() {
    let now = at("2024-03-01T12:00:00Z");
    let mut checked = 0;

    for policy in policies() {
        let windows = match plan(now, &policy) {
            Ok(windows) => windows,
            Err(TimeshardError::PolicyInfeasible { .. }) => continue,
            Err(e) => panic!("unexpected error for {:?}: {}", policy, e),
        };
        checked += 1;

        assert_eq!(windows.len(), policy.total_shards as usize);
        if policy.future_buffer_hours > 0 {
            assert!(windows[0].max_time > now, "{:?}", policy);
        } else {
            assert_eq!(windows[0].max_time, now, "{:?}", policy);
        }
        assert_eq!(
            windows[0].max_time,
            now + Duration::hours(policy.future_buffer_hours as i64)
        );

        let overlap = Duration::days(policy.overlap_days as i64);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].min_time, pair[1].max_time - overlap, "{:?}", policy);
        }
        for (index, window) in windows.iter().enumerate() {
            assert_eq!(window.shard_index, index as u32);
            assert!(window.min_time < window.max_time, "{:?}", policy);
        }

        let floor = now - Duration::days(policy.retention_days as i64);
        let oldest = windows.last().unwrap();
        assert!(oldest.min_time >= floor, "{:?}", policy);
    }

    assert!(checked > 100, "only {} policies planned", checked);
}

#[test]
fn test_planning_is_deterministic() {
    let now = at("2024-01-15T07:42:13Z");
    for policy in policies() {
        let a = plan(now, &policy);
        let b = plan(now, &policy);
        match (a, b) {
            (Ok(a), Ok(b)) => assert_eq!(a, b),
            (Err(_), Err(_)) => {}
            _ => panic!("plan is not deterministic for {:?}", policy),
        }
    }
}

#[test]
fn test_reference_layout() {
    let policy = ShardingPolicy {
        total_shards: 3,
        replicas_per_shard: 2,
        retention_days: 370,
        overlap_days: 1,
        future_buffer_hours: 24,
    };
    let windows = plan(at("2024-01-15T00:00:00Z"), &policy).unwrap();

    let bounds: Vec<_> = windows.iter().map(|w| (w.min_time, w.max_time)).collect();
    assert_eq!(
        bounds,
        vec![
            (at("2023-09-14T00:00:00Z"), at("2024-01-16T00:00:00Z")),
            (at("2023-05-14T00:00:00Z"), at("2023-09-15T00:00:00Z")),
            (at("2023-01-11T00:00:00Z"), at("2023-05-15T00:00:00Z")),
        ]
    );

    let mapping = expand(&windows, 2).unwrap();
    assert_eq!(mapping.len(), 6);
    assert!(mapping.values().filter(|w| w.shard_index == 1).count() == 2);
}

#[test]
fn test_planner_granularity_hides_minutes() {
    let policy = ShardingPolicy {
        total_shards: 2,
        replicas_per_shard: 1,
        retention_days: 60,
        overlap_days: 1,
        future_buffer_hours: 12,
    };
    let planner = WindowPlanner::new(policy, 3600).unwrap();

    let a = planner.plan(at("2024-01-15T10:05:00Z")).unwrap();
    let b = planner.plan(at("2024-01-15T10:55:59Z")).unwrap();
    let c = planner.plan(at("2024-01-15T11:00:00Z")).unwrap();
    assert_eq!(a, b);
    assert_ne!(b, c);
    assert_eq!(a[0].max_time, at("2024-01-15T22:00:00Z"));
}

#[test]
fn test_invalid_policies_rejected() {
    let base = ShardingPolicy {
        total_shards: 3,
        replicas_per_shard: 2,
        retention_days: 90,
        overlap_days: 1,
        future_buffer_hours: 24,
    };

    let zero_shards = ShardingPolicy { total_shards: 0, ..base };
    assert!(matches!(
        WindowPlanner::new(zero_shards, 3600),
        Err(TimeshardError::PolicyInfeasible { .. })
    ));

    let wide_overlap = ShardingPolicy { overlap_days: 30, ..base };
    assert!(matches!(
        plan(at("2024-01-15T00:00:00Z"), &wide_overlap),
        Err(TimeshardError::PolicyInfeasible { .. })
    ));

    let no_replicas = ShardingPolicy { replicas_per_shard: 0, ..base };
    assert!(matches!(
        no_replicas.validate(),
        Err(TimeshardError::InvalidReplicaCount { replicas: 0 })
    ));
}

#[test]
fn test_oversized_policies_rejected() {
    let now = at("2024-03-01T12:00:00Z");
    let huge_retention = ShardingPolicy {
        total_shards: 1,
        replicas_per_shard: 1,
        retention_days: 200_000_000,
        overlap_days: 0,
        future_buffer_hours: 24,
    };
    assert!(matches!(
        plan(now, &huge_retention),
        Err(TimeshardError::PolicyInfeasible { .. })
    ));
    assert!(WindowPlanner::new(huge_retention, 3600)
        .unwrap()
        .plan(now)
        .is_err());

    let huge_fleet = ShardingPolicy {
        total_shards: 100_000,
        replicas_per_shard: 100_000,
        retention_days: 200_000,
        overlap_days: 0,
        future_buffer_hours: 24,
    };
    assert!(matches!(
        huge_fleet.validate(),
        Err(TimeshardError::PolicyInfeasible { .. })
    ));
    assert!(plan(now, &huge_fleet).is_err());
}
