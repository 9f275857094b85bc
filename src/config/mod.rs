//! Configuration for the YoctoClaw agent core.
//!
//! Config is deserialized from JSON (`~/.yoctoclaw/config.json`) with serde
//! defaults for every field, so a missing or partial file still produces a
//! usable configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Agent behaviour defaults.
    #[serde(default)]
    pub agents: AgentsConfig,
    /// LLM provider endpoint settings.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Workspace directory for tools and prompts. `~` is expanded.
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        // Mirror the serde defaults so Config::default() == parse of "{}".
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

/// Container matching the `agents.defaults` layout of the config file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentsConfig {
    #[serde(default)]
    pub defaults: AgentDefaults,
}

/// Per-agent tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    /// Model identifier passed to the provider.
    #[serde(default)]
    pub model: String,
    /// Max tokens per LLM response.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Model context window in tokens. Drives budget derivation and the
    /// summarization trigger. 0 = unknown.
    #[serde(default)]
    pub context_window: u32,
    /// Max LLM/tool iterations per message before the exhaustion summary.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    /// Per-LLM-call timeout in seconds. 0 = disabled.
    #[serde(default = "default_llm_timeout_seconds")]
    pub llm_timeout_seconds: u64,
    /// Per-tool-call timeout in seconds. 0 = disabled.
    #[serde(default = "default_tool_timeout_seconds")]
    pub tool_timeout_seconds: u64,
    /// Max concurrent tool calls per iteration. 0 = unbounded within a batch.
    #[serde(default = "default_max_parallel_tool_calls")]
    pub max_parallel_tool_calls: usize,
    /// Delay in seconds before "still working" status pings. 0 = disabled.
    #[serde(default = "default_status_delay_seconds")]
    pub status_delay_seconds: u64,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        // Mirror the serde defaults so Config::default() == parse of "{}".
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

/// LLM provider endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Bearer token. Empty = send no Authorization header.
    #[serde(default)]
    pub api_key: String,
    /// Base URL, e.g. `https://openrouter.ai/api/v1`.
    #[serde(default)]
    pub api_base: String,
    /// Optional provider routing object (OpenRouter-style), passed through
    /// verbatim as the `provider` field of the request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<serde_json::Value>,
    /// Model-name substrings that require `max_completion_tokens` instead of
    /// `max_tokens` in the request body.
    #[serde(default = "default_completion_token_models")]
    pub completion_token_models: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

/// Logging output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output.
    Pretty,
    /// Single-line text, grep-friendly.
    #[default]
    Compact,
    /// Structured JSON lines for log aggregators.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Default filter level when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file path (JSON format only). None = stderr.
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

fn default_workspace() -> String {
    "~/.yoctoclaw/workspace".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tool_iterations() -> u32 {
    20
}

fn default_llm_timeout_seconds() -> u64 {
    300
}

fn default_tool_timeout_seconds() -> u64 {
    120
}

fn default_max_parallel_tool_calls() -> usize {
    4
}

fn default_status_delay_seconds() -> u64 {
    30
}

fn default_completion_token_models() -> Vec<String> {
    vec!["glm".to_string(), "o1".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// The YoctoClaw home directory (`~/.yoctoclaw`).
    pub fn dir() -> PathBuf {
        dirs_home().join(".yoctoclaw")
    }

    /// Load configuration from `~/.yoctoclaw/config.json`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(Config::dir().join("config.json"))
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// The workspace path with `~` expanded to the home directory.
    pub fn workspace_path(&self) -> PathBuf {
        if let Some(rest) = self.workspace.strip_prefix("~/") {
            dirs_home().join(rest)
        } else {
            PathBuf::from(&self.workspace)
        }
    }
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.agents.defaults.max_tokens, 8192);
        assert_eq!(cfg.agents.defaults.max_tool_iterations, 20);
        assert_eq!(cfg.agents.defaults.max_parallel_tool_calls, 4);
        assert_eq!(cfg.agents.defaults.status_delay_seconds, 30);
        assert!(cfg.provider.api_key.is_empty());
        assert_eq!(
            cfg.provider.completion_token_models,
            vec!["glm".to_string(), "o1".to_string()]
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"agents": {"defaults": {"model": "openrouter/test", "max_tokens": 1024}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.agents.defaults.model, "openrouter/test");
        assert_eq!(cfg.agents.defaults.max_tokens, 1024);
        assert_eq!(cfg.agents.defaults.temperature, 0.7);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_log_format_deserialize() {
        let cfg: LoggingConfig = serde_json::from_str(r#"{"format":"json","level":"debug"}"#).unwrap();
        assert_eq!(cfg.format, LogFormat::Json);
        assert_eq!(cfg.level, "debug");
    }

    #[test]
    fn test_workspace_expansion() {
        let mut cfg = Config::default();
        cfg.workspace = "/tmp/ws".to_string();
        assert_eq!(cfg.workspace_path(), PathBuf::from("/tmp/ws"));

        cfg.workspace = "~/ws".to_string();
        assert!(cfg.workspace_path().ends_with("ws"));
        assert!(!cfg.workspace_path().to_string_lossy().contains('~'));
    }

    #[test]
    fn test_load_from_missing_file_is_default() {
        let cfg = Config::load_from(PathBuf::from("/nonexistent/config.json")).unwrap();
        assert_eq!(cfg.agents.defaults.max_tokens, 8192);
    }

    #[test]
    fn test_provider_routing_passthrough() {
        let cfg: Config = serde_json::from_str(
            r#"{"provider": {"api_base": "https://example.test/v1", "routing": {"order": ["a", "b"]}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.provider.api_base, "https://example.test/v1");
        let routing = cfg.provider.routing.unwrap();
        assert_eq!(routing["order"][0], "a");
    }
}
