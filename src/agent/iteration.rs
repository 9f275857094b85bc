//! The LLM/tool-call iteration loop.
//!
//! `run` drives a conversation to a terminal answer: each turn budgets the
//! payload, asks the provider for a response, and either returns its text or
//! executes the requested tool calls and feeds the results back. When the
//! iteration cap is reached while the model is still requesting tools, one
//! final no-tools call asks the model to summarize progress.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, YoctoError};
use crate::providers::{
    apply_message_budget, chat_with_timeout, ChatOptions, LLMProvider, LLMToolCall, MessageBudget,
    MessageBudgetStats, ToolDefinition,
};
use crate::session::{Message, Role, ToolCall};

/// Terminal user message sent on exhaustion, before the final summary call.
const EXHAUSTION_PROMPT: &str = "You've reached your tool call iteration limit. \
Please summarize what you've accomplished so far and what still needs to be done. \
The user can tell you to continue.";

/// Builds tool definitions for an iteration: `(iteration, messages)`.
pub type ToolDefsFn = Arc<dyn Fn(u32, &[Message]) -> Vec<ToolDefinition> + Send + Sync>;

/// Executes a batch of tool calls: `(cancel, calls, iteration)` → results in
/// call order.
pub type ExecuteToolsFn =
    Arc<dyn Fn(CancellationToken, Vec<LLMToolCall>, u32) -> BoxFuture<'static, Vec<Message>> + Send + Sync>;

/// Observation hooks fired synchronously during the loop. Hooks must not
/// block indefinitely; the loop has no mitigation beyond its own context.
#[derive(Clone, Default)]
pub struct Hooks {
    pub messages_budgeted: Option<Arc<dyn Fn(u32, &MessageBudgetStats) + Send + Sync>>,
    pub before_llm_call: Option<Arc<dyn Fn(u32, &[Message], &[ToolDefinition]) + Send + Sync>>,
    pub llm_call_failed: Option<Arc<dyn Fn(u32, &YoctoError) + Send + Sync>>,
    pub tool_calls_requested: Option<Arc<dyn Fn(u32, &[LLMToolCall]) + Send + Sync>>,
    pub direct_response: Option<Arc<dyn Fn(u32, &str) + Send + Sync>>,
    pub assistant_message: Option<Arc<dyn Fn(u32, &Message) + Send + Sync>>,
    pub tool_result_message: Option<Arc<dyn Fn(u32, &Message) + Send + Sync>>,
}

/// Options for one loop run.
#[derive(Clone)]
pub struct RunOptions {
    pub provider: Arc<dyn LLMProvider>,
    pub model: String,
    pub max_iterations: u32,
    /// Per-LLM-call timeout. Zero = none.
    pub llm_timeout: Duration,
    pub chat_options: ChatOptions,
    /// Budget applied to each request payload. None/disabled = no budgeting.
    pub budget: Option<MessageBudget>,
    /// Initial message array (system prompt, history, user message).
    pub messages: Vec<Message>,
    pub build_tool_defs: Option<ToolDefsFn>,
    pub execute_tools: Option<ExecuteToolsFn>,
    pub hooks: Hooks,
}

/// Outcome of a loop run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// The working history including assistant and tool messages appended
    /// during the run (unbudgeted).
    pub messages: Vec<Message>,
    /// The final answer text.
    pub final_content: String,
    /// Number of iterations executed.
    pub iterations: u32,
    /// True when the iteration cap was hit while still requesting tools.
    pub exhausted: bool,
}

/// Convert an LLM response into the assistant message to append.
pub fn assistant_message_from_response(
    content: &str,
    tool_calls: &[LLMToolCall],
) -> Message {
    let calls = tool_calls
        .iter()
        .map(|tc| ToolCall::new(&tc.id, &tc.name, &tc.arguments_json()))
        .collect();
    Message::assistant_with_tools(content, calls)
}

/// Run the iteration loop to completion.
///
/// Provider errors abort the run; tool errors do not (they surface as
/// conversational `Error: ...` tool results the model can react to).
pub async fn run(cancel: CancellationToken, opts: RunOptions) -> Result<RunResult> {
    let mut result = RunResult {
        messages: opts.messages.clone(),
        final_content: String::new(),
        iterations: 0,
        exhausted: true,
    };

    if opts.max_iterations == 0 {
        return Ok(result);
    }

    let budget_enabled = opts.budget.as_ref().map(|b| b.enabled()).unwrap_or(false);

    for iteration in 1..=opts.max_iterations {
        result.iterations = iteration;

        let request_messages = if budget_enabled {
            let budget = opts.budget.as_ref().expect("budget enabled");
            let (budgeted, stats) = apply_message_budget(&result.messages, budget);
            if stats.changed() {
                debug!(
                    iteration,
                    dropped = stats.dropped_messages,
                    truncated = stats.truncated_messages,
                    chars_before = stats.chars_before,
                    chars_after = stats.chars_after,
                    "applied message budget"
                );
                if let Some(hook) = &opts.hooks.messages_budgeted {
                    hook(iteration, &stats);
                }
            }
            budgeted
        } else {
            result.messages.clone()
        };

        let tool_defs = match &opts.build_tool_defs {
            Some(build) => build(iteration, &request_messages),
            None => Vec::new(),
        };

        if let Some(hook) = &opts.hooks.before_llm_call {
            hook(iteration, &request_messages, &tool_defs);
        }

        info!(
            iteration,
            max = opts.max_iterations,
            model = %opts.model,
            messages_count = request_messages.len(),
            tools_count = tool_defs.len(),
            "calling LLM"
        );

        let response = match chat_with_timeout(
            cancel.clone(),
            opts.llm_timeout,
            opts.provider.as_ref(),
            request_messages,
            tool_defs,
            &opts.model,
            opts.chat_options.clone(),
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                if let Some(hook) = &opts.hooks.llm_call_failed {
                    hook(iteration, &e);
                }
                return Err(e);
            }
        };

        if !response.has_tool_calls() {
            result.final_content = response.content;
            result.exhausted = false;
            info!(
                iteration,
                content_chars = result.final_content.len(),
                "direct answer"
            );
            if let Some(hook) = &opts.hooks.direct_response {
                hook(iteration, &result.final_content);
            }
            return Ok(result);
        }

        let tool_names: Vec<&str> = response.tool_calls.iter().map(|tc| tc.name.as_str()).collect();
        info!(iteration, tools = ?tool_names, "LLM requested tool calls");
        if let Some(hook) = &opts.hooks.tool_calls_requested {
            hook(iteration, &response.tool_calls);
        }

        let assistant_msg = assistant_message_from_response(&response.content, &response.tool_calls);
        result.messages.push(assistant_msg.clone());
        if let Some(hook) = &opts.hooks.assistant_message {
            hook(iteration, &assistant_msg);
        }

        let tool_results = match &opts.execute_tools {
            Some(execute) => execute(cancel.clone(), response.tool_calls, iteration).await,
            None => Vec::new(),
        };
        for tr in tool_results {
            result.messages.push(tr.clone());
            if let Some(hook) = &opts.hooks.tool_result_message {
                hook(iteration, &tr);
            }
        }
    }

    // Iteration cap reached while still requesting tools: one final call
    // with no tools asks the model to summarize progress so the user can
    // resume with "continue".
    warn!(
        iterations = result.iterations,
        max = opts.max_iterations,
        "tool iteration limit reached, requesting summary"
    );

    result.messages.push(Message {
        role: Role::User,
        content: EXHAUSTION_PROMPT.to_string(),
        tool_calls: None,
        tool_call_id: None,
    });

    match chat_with_timeout(
        cancel.clone(),
        opts.llm_timeout,
        opts.provider.as_ref(),
        result.messages.clone(),
        Vec::new(),
        &opts.model,
        opts.chat_options.clone(),
    )
    .await
    {
        Ok(response) => {
            result.final_content = response.content;
        }
        Err(e) => {
            warn!(error = %e, "summary call failed after iteration limit");
            result.final_content = format!(
                "I reached my tool call limit ({} iterations) before finishing. \
                 Ask me to continue and I'll pick up where I left off.",
                opts.max_iterations
            );
        }
    }

    Ok(result)
}
