//! Async runtime support
//!
//! Cancellation and retry pacing shared by the reconciler and the agents.

pub mod backoff;
pub mod shutdown;

pub use backoff::RetryPolicy;
pub use shutdown::{install_os_handlers, ShutdownSignal};
