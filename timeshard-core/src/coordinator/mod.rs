//! Reconciler side
//!
//! Window planning, replica expansion, and the periodic compare-and-swap
//! loop that keeps the shared document current.

pub mod clock;
pub mod reconciler;
pub mod replicas;
pub mod window_planner;

pub use clock::{Clock, ManualClock, SystemClock};
pub use reconciler::{Reconciler, ReconcilerConfig, ReconcilerState, TickOutcome};
pub use replicas::{expand, parse_pod_ordinal, window_for_ordinal, InstanceIdentity};
pub use window_planner::{plan, truncate, ShardWindow, WindowPlanner};
