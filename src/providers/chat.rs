//! Per-call timeout wrapper for provider chat requests.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, YoctoError};
use crate::session::Message;

use super::{ChatOptions, LLMProvider, LLMResponse, ToolDefinition};

/// Wrap `provider.chat` with an optional per-call deadline.
///
/// A zero timeout applies no additional deadline. On expiry the in-flight
/// call is cancelled via a child token and a provider timeout error is
/// returned; the caller's own cancellation still surfaces as `Cancelled`.
pub async fn chat_with_timeout(
    cancel: CancellationToken,
    timeout: Duration,
    provider: &dyn LLMProvider,
    messages: Vec<Message>,
    tools: Vec<ToolDefinition>,
    model: &str,
    options: ChatOptions,
) -> Result<LLMResponse> {
    if timeout.is_zero() {
        return provider.chat(cancel, messages, tools, model, options).await;
    }

    let call_cancel = cancel.child_token();
    let call = provider.chat(call_cancel.clone(), messages, tools, model, options);
    tokio::select! {
        result = call => result,
        _ = tokio::time::sleep(timeout) => {
            call_cancel.cancel();
            Err(YoctoError::Provider(format!(
                "LLM call timed out after {:?}",
                timeout
            )))
        }
    }
}
