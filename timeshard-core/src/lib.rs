//! Timeshard Core - time-range sharding for Thanos Store Gateway fleets
//!
//! This crate provides:
//! - Window planning across shards and replicas
//! - The shared configuration document and its stores
//! - A single-writer reconciler with compare-and-swap writes
//! - Per-instance agents that render worker config and hot-reload it

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod metrics;
pub mod runtime;
pub mod store;

pub use error::{Result, TimeshardError};

/// Default metrics listen address
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9100";

/// Default reconciler planning granularity in seconds
pub const DEFAULT_TIME_GRANULARITY_SECS: u64 = 3600;
