//! Provider types for YoctoClaw
//!
//! Defines the `LLMProvider` trait and the normalized request/response types
//! shared by the agent core: chat options, responses, tool calls, and tool
//! definitions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::session::Message;

/// Definition of a tool that can be called by the LLM.
///
/// Held in the `{name, description, parameters}` form; the
/// `{"type":"function","function":{...}}` wire wrapper is applied at the
/// provider boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The name of the tool (unique within a registry)
    pub name: String,
    /// Human-readable description of what the tool does
    pub description: String,
    /// JSON Schema describing the tool's parameters
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    pub fn new(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// Trait for LLM providers.
///
/// The `cancel` token carries the request context: implementations must
/// observe it at every suspension point (network I/O, retry waits) and
/// surface cancellation as `YoctoError::Cancelled` without retrying.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Send a chat completion request.
    ///
    /// # Arguments
    /// * `cancel` - Request context; cancelling aborts the call promptly
    /// * `messages` - The conversation history
    /// * `tools` - Available tools the LLM can call (may be empty)
    /// * `model` - Model identifier
    /// * `options` - Max tokens, temperature, etc.
    async fn chat(
        &self,
        cancel: CancellationToken,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        model: &str,
        options: ChatOptions,
    ) -> Result<LLMResponse>;

    /// The default model for this provider (empty when the caller must choose).
    fn default_model(&self) -> &str {
        ""
    }
}

/// Options for chat completion requests.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Maximum number of tokens to generate
    pub max_tokens: Option<u32>,
    /// Temperature for sampling
    pub temperature: Option<f32>,
}

impl ChatOptions {
    /// Create new default chat options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of tokens to generate.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Normalized response from a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
    /// Text content of the response (may be empty)
    pub content: String,
    /// Tool calls made by the LLM, in provider order
    pub tool_calls: Vec<LLMToolCall>,
    /// Provider finish reason ("stop", "length", "error", ...)
    pub finish_reason: String,
    /// Token usage, when the provider reports it
    pub usage: Option<Usage>,
}

impl LLMResponse {
    /// Create a simple text response with no tool calls.
    pub fn text(content: &str) -> Self {
        Self {
            content: content.to_string(),
            tool_calls: vec![],
            finish_reason: "stop".to_string(),
            usage: None,
        }
    }

    /// Create a response carrying tool calls.
    pub fn with_tools(content: &str, tool_calls: Vec<LLMToolCall>) -> Self {
        Self {
            content: content.to_string(),
            tool_calls,
            finish_reason: "tool_calls".to_string(),
            usage: None,
        }
    }

    /// Whether this response contains any tool calls.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A tool call made by the LLM, with parsed arguments.
///
/// When the provider's argument JSON fails to parse, `arguments` becomes
/// `{"raw": <original>}` and `raw_arguments` preserves the original string so
/// the call can be re-serialized byte-faithfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMToolCall {
    /// Opaque identifier chosen by the provider
    pub id: String,
    /// Name of the tool to execute
    pub name: String,
    /// Parsed arguments mapping
    pub arguments: Map<String, Value>,
    /// Original argument string, kept when parsing failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_arguments: Option<String>,
}

impl LLMToolCall {
    /// Create a tool call from an argument JSON string, preserving the raw
    /// string when it does not parse as an object.
    pub fn new(id: &str, name: &str, arguments: &str) -> Self {
        let (parsed, raw) = parse_arguments(arguments);
        Self {
            id: id.to_string(),
            name: name.to_string(),
            arguments: parsed,
            raw_arguments: raw,
        }
    }

    /// Create a tool call from an already-parsed argument map.
    pub fn with_args(id: &str, name: &str, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
            raw_arguments: None,
        }
    }

    /// The JSON string form of the arguments. Prefers the preserved raw
    /// string so re-serialization is faithful to what the provider sent.
    pub fn arguments_json(&self) -> String {
        if let Some(raw) = &self.raw_arguments {
            return raw.clone();
        }
        serde_json::to_string(&self.arguments).unwrap_or_else(|_| "{}".to_string())
    }

    /// The arguments as a `serde_json::Value` object.
    pub fn arguments_value(&self) -> Value {
        Value::Object(self.arguments.clone())
    }
}

fn parse_arguments(arguments: &str) -> (Map<String, Value>, Option<String>) {
    if arguments.is_empty() {
        return (Map::new(), None);
    }
    match serde_json::from_str::<Map<String, Value>>(arguments) {
        Ok(map) => (map, None),
        Err(_) => {
            let mut map = Map::new();
            map.insert("raw".to_string(), Value::String(arguments.to_string()));
            (map, Some(arguments.to_string()))
        }
    }
}

/// Token usage reported by a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,
    /// Tokens in the completion
    pub completion_tokens: u32,
    /// Total tokens used
    pub total_tokens: u32,
}

impl Usage {
    /// Create usage info; `total_tokens` is derived.
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}
