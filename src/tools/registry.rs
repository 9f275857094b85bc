//! Tool registry for YoctoClaw
//!
//! Holds tools, enforces the execution policy, and injects per-request
//! context into tool arguments under reserved keys. Registration is
//! serialized behind a write lock; execution takes a short read lock to
//! clone the tool handle and never holds it across an await.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{Result, YoctoError};
use crate::providers::ToolDefinition;

use super::policy::ToolExecutionPolicy;
use super::types::Tool;

/// Reserved argument keys carrying per-request context into tools.
pub const CONTEXT_CHANNEL_KEY: &str = "__context_channel";
pub const CONTEXT_CHAT_ID_KEY: &str = "__context_chat_id";
pub const CONTEXT_TRACE_ID_KEY: &str = "__context_trace_id";

/// Copy `args`, injecting the reserved context keys for non-empty values.
pub fn with_execution_context(args: Value, channel: &str, chat_id: &str, trace_id: &str) -> Value {
    if channel.is_empty() && chat_id.is_empty() && trace_id.is_empty() {
        return args;
    }

    let mut map = match args {
        Value::Object(map) => map,
        // Non-object args are preserved under "raw" so nothing is lost.
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("raw".to_string(), other);
            map
        }
    };
    if !channel.is_empty() {
        map.insert(CONTEXT_CHANNEL_KEY.to_string(), Value::String(channel.to_string()));
    }
    if !chat_id.is_empty() {
        map.insert(CONTEXT_CHAT_ID_KEY.to_string(), Value::String(chat_id.to_string()));
    }
    if !trace_id.is_empty() {
        map.insert(CONTEXT_TRACE_ID_KEY.to_string(), Value::String(trace_id.to_string()));
    }
    Value::Object(map)
}

/// Read the (channel, chat_id) execution context back out of tool args.
pub fn execution_context(args: &Value) -> (String, String) {
    let get = |key: &str| {
        args.get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    (get(CONTEXT_CHANNEL_KEY), get(CONTEXT_CHAT_ID_KEY))
}

/// Read the trace id out of tool args.
pub fn execution_trace_id(args: &Value) -> String {
    args.get(CONTEXT_TRACE_ID_KEY)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// A registry that holds and manages tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    policy: RwLock<ToolExecutionPolicy>,
}

impl ToolRegistry {
    /// Create a new empty tool registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            policy: RwLock::new(ToolExecutionPolicy::default()),
        }
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        info!(tool = %name, "registering tool");
        self.tools.write().expect("registry lock").insert(name, tool);
    }

    /// Set the execution policy.
    pub fn set_execution_policy(&self, policy: ToolExecutionPolicy) {
        *self.policy.write().expect("policy lock") = policy;
    }

    /// Get a tool handle by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().expect("registry lock").get(name).cloned()
    }

    /// Whether a tool is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tools.read().expect("registry lock").contains_key(name)
    }

    /// The number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.read().expect("registry lock").len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of all registered tools, sorted for stable output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .expect("registry lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Tool definitions for LLM providers, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .expect("registry lock")
            .values()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.parameters()))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// One-line `name: description` summaries for prompt building, sorted.
    pub fn summaries(&self) -> Vec<String> {
        let mut summaries: Vec<String> = self
            .tools
            .read()
            .expect("registry lock")
            .values()
            .map(|t| format!("- {}: {}", t.name(), t.description()))
            .collect();
        summaries.sort();
        summaries
    }

    /// Execute a tool by name with no injected context.
    pub async fn execute(&self, cancel: CancellationToken, name: &str, args: Value) -> Result<String> {
        self.execute_with_context(cancel, name, args, "", "", "").await
    }

    /// Execute a tool by name, injecting channel/chat/trace context into the
    /// args under the reserved keys. Policy is enforced first.
    pub async fn execute_with_context(
        &self,
        cancel: CancellationToken,
        name: &str,
        args: Value,
        channel: &str,
        chat_id: &str,
        trace_id: &str,
    ) -> Result<String> {
        {
            let policy = self.policy.read().expect("policy lock");
            policy.check(name)?;
        }

        let tool = self
            .get(name)
            .ok_or_else(|| YoctoError::Tool(format!("tool not found: {}", name)))?;

        let args = with_execution_context(args, channel, chat_id, trace_id);

        let start = Instant::now();
        match tool.execute(cancel, args).await {
            Ok(result) => {
                info!(
                    tool = name,
                    trace_id = trace_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "tool executed"
                );
                Ok(result)
            }
            Err(e) => {
                error!(
                    tool = name,
                    trace_id = trace_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    error = %e,
                    "tool execution failed"
                );
                Err(e)
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
