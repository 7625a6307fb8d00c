//! Instance agent
//!
//! Runs next to each worker process and keeps its config in step with the
//! shared document.

pub mod instance;
pub mod reload;
pub mod render;
pub mod state;

pub use instance::{AgentStats, HandleOutcome, InstanceAgent, InstanceAgentConfig};
pub use reload::{ReloadTrigger, ScriptedReloader, SignalReloader};
pub use render::Renderer;
pub use state::{AgentPhase, AppliedState};
