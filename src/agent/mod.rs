//! Agent module - the iteration loop and message processing core
//!
//! - `iteration`: the reusable LLM/tool-call loop with hooks and exhaustion
//!   handling
//! - `AgentLoop`: bus consumption, session coupling, system-message routing,
//!   and summarization
//! - `ContextBuilder`: system prompt and message-array assembly
//! - `StatusNotifier`: periodic "still working" pings during long tool runs

mod context;
pub mod iteration;
mod r#loop;
mod status;

pub use context::ContextBuilder;
pub use iteration::{ExecuteToolsFn, Hooks, RunOptions, RunResult, ToolDefsFn};
pub use r#loop::AgentLoop;
pub use status::StatusNotifier;
