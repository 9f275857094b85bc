//! YoctoClaw - the agent execution core of a lightweight, multi-channel AI
//! assistant runtime.
//!
//! The core receives natural-language messages from chat channels over a
//! bounded message bus, drives an LLM through iterative tool-calling turns,
//! executes tools concurrently with bounded parallelism, and optionally
//! delegates work to background subagents that report back over the bus.

pub mod agent;
pub mod bus;
pub mod config;
pub mod error;
pub mod providers;
pub mod session;
pub mod tools;
pub mod utils;

pub use agent::AgentLoop;
pub use bus::{InboundMessage, MessageBus, OutboundMessage};
pub use config::Config;
pub use error::{Result, YoctoError};
pub use providers::{
    ChatOptions, HttpProvider, LLMProvider, LLMResponse, LLMToolCall, MessageBudget,
    MessageBudgetStats, ToolDefinition, Usage,
};
pub use session::{Message, Role, Session, SessionManager, ToolCall};
pub use tools::{SubagentManager, Tool, ToolRegistry};
