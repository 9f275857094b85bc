//! Providers module - LLM provider client, budgeting, and call helpers
//!
//! Defines the `LLMProvider` trait, the resilient `HttpProvider` for
//! OpenAI-compatible chat completion endpoints, the deterministic message
//! budgeter, and the per-call timeout wrapper.

pub mod budget;
pub mod chat;
pub mod http;
mod types;

pub use budget::{apply_message_budget, MessageBudget, MessageBudgetStats};
pub use chat::chat_with_timeout;
pub use http::HttpProvider;
pub use types::{ChatOptions, LLMProvider, LLMResponse, LLMToolCall, ToolDefinition, Usage};

use crate::config::Config;
use crate::error::{Result, YoctoError};

/// Build an [`HttpProvider`] from configuration.
///
/// Missing API base is a configuration error, surfaced immediately.
pub fn create_provider(config: &Config) -> Result<HttpProvider> {
    let p = &config.provider;
    if p.api_base.is_empty() {
        return Err(YoctoError::Config(format!(
            "no API base configured for provider (model: {})",
            config.agents.defaults.model
        )));
    }

    let mut provider = HttpProvider::new(&p.api_key, &p.api_base)
        .with_completion_token_models(p.completion_token_models.clone())
        .with_default_model(&config.agents.defaults.model);
    if let Some(routing) = &p.routing {
        provider = provider.with_routing(routing.clone());
    }
    Ok(provider)
}
