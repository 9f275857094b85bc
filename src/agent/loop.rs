//! The main agent loop.
//!
//! Consumes inbound messages from the bus, builds conversation context from
//! session history and summary, drives the iteration loop, and publishes
//! responses. System-channel messages (subagent reports) are routed back to
//! their origin session: progress-like events become internal notes, terminal
//! events run through the loop so the model can present them to the user.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{InboundMessage, MessageBus, OutboundMessage, SYSTEM_CHANNEL};
use crate::config::Config;
use crate::error::Result;
use crate::providers::{chat_with_timeout, ChatOptions, LLMProvider, MessageBudget};
use crate::session::{Message, Role, SessionManager};
use crate::tools::executor::ExecuteToolCallsOptions;
use crate::tools::{SpawnTool, SubagentManager, Tool, ToolCompleteFn, ToolRegistry};
use crate::utils::truncate;

use super::context::ContextBuilder;
use super::iteration::{self, ExecuteToolsFn, RunOptions};
use super::status::StatusNotifier;

/// How a single message run behaves.
#[derive(Debug, Clone)]
struct ProcessOptions {
    session_key: String,
    channel: String,
    chat_id: String,
    user_message: String,
    default_response: String,
    enable_summary: bool,
    send_response: bool,
}

/// The main agent: one instance serves all sessions of a runtime.
pub struct AgentLoop {
    config: Config,
    bus: MessageBus,
    provider: Arc<dyn LLMProvider>,
    sessions: SessionManager,
    tools: Arc<ToolRegistry>,
    subagents: Arc<SubagentManager>,
    running: AtomicBool,
    /// Sessions with an in-flight summarization; shared with the detached
    /// summarizer tasks.
    summarizing: Arc<Mutex<HashSet<String>>>,
    model: String,
    context_window: u32,
    budget: MessageBudget,
    max_iterations: u32,
    llm_timeout: Duration,
    tool_timeout: Duration,
    max_parallel_tools: usize,
    status_delay: Duration,
}

impl AgentLoop {
    /// Create an agent loop. Registers the `spawn` tool; other tools are
    /// added by the embedding runtime via [`register_tool`].
    ///
    /// [`register_tool`]: AgentLoop::register_tool
    pub fn new(
        config: Config,
        bus: MessageBus,
        provider: Arc<dyn LLMProvider>,
        sessions: SessionManager,
    ) -> Arc<Self> {
        let defaults = &config.agents.defaults;
        let model = if defaults.model.is_empty() {
            provider.default_model().to_string()
        } else {
            defaults.model.clone()
        };

        let budget = if defaults.context_window > 0 {
            MessageBudget::from_context_window(defaults.context_window as usize)
        } else {
            MessageBudget::default()
        };

        let subagents = Arc::new(SubagentManager::new(
            Arc::clone(&provider),
            &model,
            config.workspace_path(),
            Some(bus.clone()),
        ));

        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(SpawnTool::new(Arc::clone(&subagents))));

        Arc::new(Self {
            model,
            context_window: defaults.context_window,
            budget,
            max_iterations: defaults.max_tool_iterations,
            llm_timeout: Duration::from_secs(defaults.llm_timeout_seconds),
            tool_timeout: Duration::from_secs(defaults.tool_timeout_seconds),
            max_parallel_tools: defaults.max_parallel_tool_calls,
            status_delay: Duration::from_secs(defaults.status_delay_seconds),
            config,
            bus,
            provider,
            sessions,
            tools,
            subagents: Arc::clone(&subagents),
            running: AtomicBool::new(false),
            summarizing: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Register a tool with the agent.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) {
        self.tools.register(tool);
    }

    /// The tool registry.
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// The subagent manager.
    pub fn subagents(&self) -> &Arc<SubagentManager> {
        &self.subagents
    }

    /// The session manager.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// The message bus.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// The configuration this loop was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether the consume loop is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Consume inbound messages until `cancel` fires or the bus closes.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("agent loop started");

        while !cancel.is_cancelled() {
            let Some(msg) = self.bus.consume_inbound(&cancel).await else {
                break;
            };

            let preview = truncate(&msg.content, 80);
            info!(
                channel = %msg.channel,
                chat_id = %msg.chat_id,
                sender_id = %msg.sender_id,
                session_key = %msg.session_key,
                content = %preview,
                "processing message"
            );

            let response = match self.process_message(cancel.clone(), &msg).await {
                Ok(response) => response,
                Err(e) => {
                    error!(error = %e, session_key = %msg.session_key, "message processing failed");
                    format!("Error processing message: {}", e)
                }
            };

            if !response.is_empty() {
                self.bus
                    .publish_outbound(OutboundMessage::new(&msg.channel, &msg.chat_id, &response));
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("agent loop stopped");
        Ok(())
    }

    /// Process one inbound message and return the response text (empty when
    /// the message produced no user-facing output).
    pub async fn process_message(
        &self,
        cancel: CancellationToken,
        msg: &InboundMessage,
    ) -> Result<String> {
        if msg.channel == SYSTEM_CHANNEL {
            return self.process_system_message(cancel, msg).await;
        }

        self.run_agent_loop(
            cancel,
            ProcessOptions {
                session_key: msg.session_key.clone(),
                channel: msg.channel.clone(),
                chat_id: msg.chat_id.clone(),
                user_message: msg.content.clone(),
                default_response: "I've completed processing but have no response to give."
                    .to_string(),
                enable_summary: true,
                send_response: false,
            },
        )
        .await
    }

    /// Process a direct request outside any channel (cron, embedding hosts).
    pub async fn process_direct(
        &self,
        cancel: CancellationToken,
        content: &str,
        session_key: &str,
    ) -> Result<String> {
        self.process_direct_with_channel(cancel, content, session_key, "cli", "direct")
            .await
    }

    /// Process a direct request with explicit channel routing for tools.
    pub async fn process_direct_with_channel(
        &self,
        cancel: CancellationToken,
        content: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
    ) -> Result<String> {
        let mut msg = InboundMessage::new(channel, "direct", chat_id, content);
        msg.session_key = session_key.to_string();
        self.process_message(cancel, &msg).await
    }

    /// Handle a system-channel message: parse origin routing from the
    /// chat_id, keep subagent progress internal, and run terminal events
    /// through the loop with the response going back to the origin channel.
    async fn process_system_message(
        &self,
        cancel: CancellationToken,
        msg: &InboundMessage,
    ) -> Result<String> {
        let (origin_channel, origin_chat_id) = match msg.chat_id.split_once(':') {
            Some((channel, chat_id)) if !channel.is_empty() => {
                (channel.to_string(), chat_id.to_string())
            }
            _ => ("cli".to_string(), msg.chat_id.clone()),
        };
        let session_key = format!("{}:{}", origin_channel, origin_chat_id);

        info!(
            sender_id = %msg.sender_id,
            session_key = %session_key,
            "processing system message"
        );

        // Subagent progress reports never reach the end user: store them as
        // internal notes the model sees on its next turn.
        if msg.sender_id.starts_with("subagent:") {
            let event = msg
                .metadata
                .get("subagent_event")
                .map(String::as_str)
                .unwrap_or("");
            if matches!(event, "progress" | "note" | "warning") {
                let internal = format!("[Internal: {}] {}", msg.sender_id, msg.content);
                self.sessions
                    .append(&session_key, "assistant", &internal)
                    .await;
                self.sessions.persist(&session_key).await?;
                info!(
                    session_key = %session_key,
                    event = event,
                    sender_id = %msg.sender_id,
                    "stored subagent update (internal)"
                );
                return Ok(String::new());
            }
        }

        let outcome = self
            .run_agent_loop(
                cancel,
                ProcessOptions {
                    session_key,
                    channel: origin_channel.clone(),
                    chat_id: origin_chat_id.clone(),
                    user_message: format!("[System: {}] {}", msg.sender_id, msg.content),
                    default_response: "Background task completed.".to_string(),
                    enable_summary: false,
                    send_response: true,
                },
            )
            .await;

        if let Err(e) = outcome {
            // Never route errors to the system pseudo-channel; tell the
            // origin chat directly.
            self.bus.publish_outbound(OutboundMessage::new(
                &origin_channel,
                &origin_chat_id,
                &format!("Error processing background task: {}", e),
            ));
        }
        Ok(String::new())
    }

    /// The core processing pipeline for one message.
    async fn run_agent_loop(&self, cancel: CancellationToken, opts: ProcessOptions) -> Result<String> {
        let trace_id = uuid::Uuid::new_v4().to_string();

        let history = self.sessions.get_history(&opts.session_key).await;
        let summary = self.sessions.get_summary(&opts.session_key).await;
        let context_builder = ContextBuilder::new()
            .with_workspace(&self.config.workspace_path().to_string_lossy())
            .with_tool_summaries(self.tools.summaries());
        let messages = context_builder.build_messages(history, summary.as_deref(), &opts.user_message);
        let initial_len = messages.len();

        self.sessions
            .append(&opts.session_key, "user", &opts.user_message)
            .await;

        let run_opts = RunOptions {
            provider: Arc::clone(&self.provider),
            model: self.model.clone(),
            max_iterations: self.max_iterations,
            llm_timeout: self.llm_timeout,
            chat_options: ChatOptions::new()
                .with_max_tokens(self.config.agents.defaults.max_tokens)
                .with_temperature(self.config.agents.defaults.temperature),
            budget: Some(self.budget.clone()),
            messages,
            build_tool_defs: Some({
                let tools = Arc::clone(&self.tools);
                Arc::new(move |_, _| tools.definitions())
            }),
            execute_tools: Some(self.tool_executor(&opts, &trace_id)),
            hooks: Default::default(),
        };

        let result = iteration::run(cancel, run_opts).await?;

        // Persist the assistant/tool messages the run appended, in order.
        for message in result.messages.iter().skip(initial_len) {
            // The exhaustion prompt is loop-internal, not conversation state.
            if message.role == Role::User {
                continue;
            }
            self.sessions
                .append_full(&opts.session_key, message.clone())
                .await;
        }

        let final_content = if result.final_content.is_empty() {
            opts.default_response.clone()
        } else {
            result.final_content
        };

        self.sessions
            .append(&opts.session_key, "assistant", &final_content)
            .await;
        self.sessions.persist(&opts.session_key).await?;

        if opts.enable_summary {
            self.maybe_summarize(&opts.session_key).await;
        }

        if opts.send_response {
            self.bus
                .publish_outbound(OutboundMessage::new(&opts.channel, &opts.chat_id, &final_content));
        }

        info!(
            session_key = %opts.session_key,
            trace_id = %trace_id,
            iterations = result.iterations,
            exhausted = result.exhausted,
            final_length = final_content.len(),
            response = %truncate(&final_content, 120),
            "response ready"
        );

        Ok(final_content)
    }

    /// Build the tool-execution closure for one message run: bounded-parallel
    /// batches with per-tool progress pings and a periodic status notifier on
    /// user-facing channels.
    fn tool_executor(&self, opts: &ProcessOptions, trace_id: &str) -> ExecuteToolsFn {
        let registry = Arc::clone(&self.tools);
        let bus = self.bus.clone();
        let channel = opts.channel.clone();
        let chat_id = opts.chat_id.clone();
        let trace_id = trace_id.to_string();
        let tool_timeout = self.tool_timeout;
        let max_parallel = self.max_parallel_tools;
        let status_delay = self.status_delay;
        let send_progress = opts.channel != SYSTEM_CHANNEL;

        Arc::new(move |cancel, calls, iteration| {
            let registry = Arc::clone(&registry);
            let bus = bus.clone();
            let channel = channel.clone();
            let chat_id = chat_id.clone();
            let trace_id = trace_id.clone();

            Box::pin(async move {
                let n = calls.len();

                let notifier = if send_progress && !status_delay.is_zero() {
                    let notifier =
                        StatusNotifier::new(bus.clone(), &channel, &chat_id, status_delay);
                    notifier.start(&format!("{} tools", n));
                    Some(notifier)
                } else {
                    None
                };

                let on_tool_complete: Option<ToolCompleteFn> = if send_progress && n > 1 {
                    let bus = bus.clone();
                    let channel = channel.clone();
                    let chat_id = chat_id.clone();
                    Some(Arc::new(move |completed, total, _index, call, _result| {
                        bus.publish_outbound(OutboundMessage::new(
                            &channel,
                            &chat_id,
                            &format!("{} done ({}/{})", call.name, completed, total),
                        ));
                    }))
                } else {
                    None
                };

                let exec_opts = ExecuteToolCallsOptions {
                    channel,
                    chat_id,
                    trace_id,
                    timeout: tool_timeout,
                    max_parallel,
                    log_component: "agent".to_string(),
                    iteration,
                    on_tool_complete,
                };

                let results = registry.execute_tool_calls(cancel, &calls, exec_opts).await;
                if let Some(notifier) = notifier {
                    notifier.stop();
                }
                results
            })
        })
    }

    /// Trigger background summarization when the session history outgrows
    /// its budget: past 75% of the context window when known, past 20
    /// messages otherwise. One summarization per session at a time.
    async fn maybe_summarize(&self, session_key: &str) {
        let history = self.sessions.get_history(session_key).await;

        let should_summarize = if self.context_window > 0 {
            let estimate = estimate_tokens(&history);
            estimate > (self.context_window as usize) * 75 / 100
        } else {
            history.len() > 20
        };

        if !should_summarize {
            return;
        }

        {
            let mut summarizing = self.summarizing.lock().expect("summarizing lock");
            if !summarizing.insert(session_key.to_string()) {
                return;
            }
        }

        let sessions = self.sessions.clone();
        let provider = Arc::clone(&self.provider);
        let model = self.model.clone();
        let context_window = self.context_window;
        let session_key = session_key.to_string();
        let summarizing = Arc::clone(&self.summarizing);
        tokio::spawn(async move {
            summarize_session(&sessions, provider.as_ref(), &model, context_window, &session_key)
                .await;
            summarizing
                .lock()
                .expect("summarizing lock")
                .remove(&session_key);
        });
    }
}

/// Estimate token count with the 4-chars-per-token heuristic, rounding up.
fn estimate_tokens(messages: &[Message]) -> usize {
    let chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
    chars.div_ceil(4)
}

/// Summarize a session: keep the last 4 messages for continuity, compact the
/// rest (in two merged batches when long), store the summary and truncate.
async fn summarize_session(
    sessions: &SessionManager,
    provider: &dyn LLMProvider,
    model: &str,
    context_window: u32,
    session_key: &str,
) {
    let cancel = CancellationToken::new();
    let history = sessions.get_history(session_key).await;
    let existing_summary = sessions.get_summary(session_key).await;

    if history.len() <= 4 {
        return;
    }
    let to_summarize = &history[..history.len() - 4];

    // Skip messages larger than half the context window so the summarizer
    // itself cannot overflow.
    let max_message_tokens = if context_window > 0 {
        (context_window / 2) as usize
    } else {
        usize::MAX
    };
    let mut omitted = false;
    let valid: Vec<&Message> = to_summarize
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .filter(|m| {
            let tokens = m.content.chars().count() / 4;
            if tokens > max_message_tokens {
                omitted = true;
                false
            } else {
                true
            }
        })
        .collect();

    if valid.is_empty() {
        return;
    }

    let mut final_summary = if valid.len() > 10 {
        let mid = valid.len() / 2;
        let s1 = summarize_batch(&cancel, provider, model, &valid[..mid], None).await;
        let s2 = summarize_batch(&cancel, provider, model, &valid[mid..], None).await;
        match (s1, s2) {
            (Some(s1), Some(s2)) => {
                let merge_prompt = format!(
                    "Merge these two conversation summaries into one cohesive summary:\n\n1: {}\n\n2: {}",
                    s1, s2
                );
                match chat_with_timeout(
                    cancel.clone(),
                    Duration::from_secs(120),
                    provider,
                    vec![Message::user(&merge_prompt)],
                    Vec::new(),
                    model,
                    ChatOptions::new().with_max_tokens(1024).with_temperature(0.3),
                )
                .await
                {
                    Ok(resp) => resp.content,
                    Err(_) => format!("{} {}", s1, s2),
                }
            }
            (Some(s), None) | (None, Some(s)) => s,
            (None, None) => String::new(),
        }
    } else {
        summarize_batch(&cancel, provider, model, &valid, existing_summary.as_deref())
            .await
            .unwrap_or_default()
    };

    if omitted && !final_summary.is_empty() {
        final_summary
            .push_str("\n[Note: Some oversized messages were omitted from this summary for efficiency.]");
    }

    if final_summary.is_empty() {
        return;
    }

    sessions.set_summary(session_key, &final_summary).await;
    sessions.truncate_history(session_key, 4).await;
    if let Err(e) = sessions.persist(session_key).await {
        warn!(session_key = session_key, error = %e, "failed to persist summarized session");
    } else {
        debug!(session_key = session_key, "session summarized");
    }
}

async fn summarize_batch(
    cancel: &CancellationToken,
    provider: &dyn LLMProvider,
    model: &str,
    batch: &[&Message],
    existing_summary: Option<&str>,
) -> Option<String> {
    let mut prompt = String::from(
        "Provide a concise summary of this conversation segment, preserving core context and key points.\n",
    );
    if let Some(existing) = existing_summary.filter(|s| !s.is_empty()) {
        prompt.push_str(&format!("Existing context: {}\n", existing));
    }
    prompt.push_str("\nCONVERSATION:\n");
    for m in batch {
        prompt.push_str(&format!("{}: {}\n", m.role, m.content));
    }

    match chat_with_timeout(
        cancel.clone(),
        Duration::from_secs(120),
        provider,
        vec![Message::user(&prompt)],
        Vec::new(),
        model,
        ChatOptions::new().with_max_tokens(1024).with_temperature(0.3),
    )
    .await
    {
        Ok(resp) if !resp.content.is_empty() => Some(resp.content),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "summarization batch failed");
            None
        }
    }
}
