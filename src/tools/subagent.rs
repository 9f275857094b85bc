//! Background subagent task management.
//!
//! The `SubagentManager` owns long-running tasks, each driven by its own
//! iteration loop against an isolated tool registry. A task's cancellation
//! token is created fresh at spawn time, never derived from the caller's
//! context: the spawning request handler may return long before the task
//! finishes, and explicit `cancel(id)` is the only way to stop one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::iteration::{self, ExecuteToolsFn, RunOptions};
use crate::bus::{InboundMessage, MessageBus};
use crate::error::{Result, YoctoError};
use crate::providers::{ChatOptions, LLMProvider};
use crate::session::Message;
use crate::tools::executor::ExecuteToolCallsOptions;
use crate::tools::report::SubagentReportTool;
use crate::tools::{Tool, ToolRegistry};
use crate::utils::truncate;

/// Lifecycle state of a subagent task. Transitions are monotone:
/// running → (cancelling → cancelled | completed | failed), nothing after a
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Cancelled | TaskStatus::Completed | TaskStatus::Failed
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Cancelling => write!(f, "cancelling"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A background task record. `get_task`/`list_tasks` return deep copies.
#[derive(Debug, Clone)]
pub struct SubagentTask {
    /// Monotonic process-unique id ("subagent-N")
    pub id: String,
    /// The task description given to the subagent
    pub task: String,
    /// Optional short display label
    pub label: String,
    /// Channel the spawning request came from
    pub origin_channel: String,
    /// Chat the spawning request came from
    pub origin_chat_id: String,
    pub status: TaskStatus,
    /// Final output; empty until terminal
    pub result: String,
    /// Unix millis
    pub created_at: i64,
    /// Unix millis; 0 until terminal
    pub finished_at: i64,
}

impl SubagentTask {
    /// The label, falling back to the id when unset.
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

/// Builds the base tools for each subagent registry (the `subagent_report`
/// tool is always added on top).
pub type ToolBuilderFn = Arc<dyn Fn() -> Vec<Arc<dyn Tool>> + Send + Sync>;

struct ManagerState {
    tasks: HashMap<String, SubagentTask>,
    cancels: HashMap<String, CancellationToken>,
    next_id: u64,
    max_tasks: usize,
    completed_ttl: Duration,
}

/// Owns the set of background subagent tasks.
pub struct SubagentManager {
    provider: Arc<dyn LLMProvider>,
    model: String,
    workspace: PathBuf,
    bus: Option<MessageBus>,
    state: Arc<RwLock<ManagerState>>,
    tool_builder: Arc<RwLock<Option<ToolBuilderFn>>>,
    skills_summary: Arc<RwLock<Option<String>>>,
    max_iterations: u32,
    llm_timeout: Duration,
    tool_timeout: Duration,
    max_parallel_tools: usize,
}

impl Clone for SubagentManager {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            model: self.model.clone(),
            workspace: self.workspace.clone(),
            bus: self.bus.clone(),
            state: Arc::clone(&self.state),
            tool_builder: Arc::clone(&self.tool_builder),
            skills_summary: Arc::clone(&self.skills_summary),
            max_iterations: self.max_iterations,
            llm_timeout: self.llm_timeout,
            tool_timeout: self.tool_timeout,
            max_parallel_tools: self.max_parallel_tools,
        }
    }
}

impl SubagentManager {
    /// Create a manager. `bus` may be `None` in embedding contexts that do
    /// not route subagent output (reports become no-ops).
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        model: &str,
        workspace: PathBuf,
        bus: Option<MessageBus>,
    ) -> Self {
        Self {
            provider,
            model: model.to_string(),
            workspace,
            bus,
            state: Arc::new(RwLock::new(ManagerState {
                tasks: HashMap::new(),
                cancels: HashMap::new(),
                next_id: 1,
                max_tasks: 100,
                completed_ttl: Duration::from_secs(24 * 3600),
            })),
            tool_builder: Arc::new(RwLock::new(None)),
            skills_summary: Arc::new(RwLock::new(None)),
            max_iterations: 10,
            llm_timeout: Duration::from_secs(300),
            tool_timeout: Duration::from_secs(120),
            max_parallel_tools: 4,
        }
    }

    /// Provide the base tool set for subagent registries.
    pub fn set_tool_builder(&self, builder: ToolBuilderFn) {
        *self.tool_builder.write().expect("tool builder lock") = Some(builder);
    }

    /// Provide a skills summary section for subagent system prompts.
    pub fn set_skills_summary(&self, summary: &str) {
        *self.skills_summary.write().expect("skills lock") = Some(summary.to_string());
    }

    /// Set retention limits: evict terminal tasks older than `completed_ttl`
    /// and keep at most `max_tasks` records. Running and cancelling tasks
    /// are never evicted.
    pub fn configure_retention(&self, max_tasks: usize, completed_ttl: Duration) {
        let mut state = self.state.write().expect("state lock");
        state.max_tasks = max_tasks;
        state.completed_ttl = completed_ttl;
        cleanup_locked(&mut state, now_millis());
    }

    /// Spawn a background task and return its id.
    ///
    /// The task's cancellation token is decoupled from the caller: the
    /// spawning handler returning does not stop the task.
    pub fn spawn(
        &self,
        task: &str,
        label: &str,
        origin_channel: &str,
        origin_chat_id: &str,
    ) -> Result<String> {
        if task.trim().is_empty() {
            return Err(YoctoError::Tool("task is required".into()));
        }

        let cancel = CancellationToken::new();
        let task_id = {
            let mut state = self.state.write().expect("state lock");
            let task_id = format!("subagent-{}", state.next_id);
            state.next_id += 1;

            state.tasks.insert(
                task_id.clone(),
                SubagentTask {
                    id: task_id.clone(),
                    task: task.to_string(),
                    label: label.to_string(),
                    origin_channel: origin_channel.to_string(),
                    origin_chat_id: origin_chat_id.to_string(),
                    status: TaskStatus::Running,
                    result: String::new(),
                    created_at: now_millis(),
                    finished_at: 0,
                },
            );
            state.cancels.insert(task_id.clone(), cancel.clone());
            cleanup_locked(&mut state, now_millis());
            task_id
        };

        info!(
            task_id = %task_id,
            label = label,
            origin_channel = origin_channel,
            origin_chat_id = origin_chat_id,
            "spawning subagent"
        );

        let manager = self.clone();
        let worker_task_id = task_id.clone();
        tokio::spawn(async move {
            manager.run_task(&worker_task_id, cancel).await;
        });

        Ok(task_id)
    }

    /// Request cancellation of a running task.
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.write().expect("state lock");
        let Some(task) = state.tasks.get_mut(task_id) else {
            return Err(YoctoError::TaskNotFound(task_id.to_string()));
        };
        if task.status.is_terminal() {
            return Err(YoctoError::TaskNotRunning(task_id.to_string()));
        }
        task.status = TaskStatus::Cancelling;
        if let Some(cancel) = state.cancels.get(task_id) {
            cancel.cancel();
        }
        Ok(())
    }

    /// A deep copy of a task record, if it exists.
    pub fn get_task(&self, task_id: &str) -> Option<SubagentTask> {
        let state = self.state.read().expect("state lock");
        state.tasks.get(task_id).cloned()
    }

    /// Deep copies of all task records, newest first.
    pub fn list_tasks(&self) -> Vec<SubagentTask> {
        let state = self.state.read().expect("state lock");
        let mut tasks: Vec<SubagentTask> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    async fn run_task(&self, task_id: &str, cancel: CancellationToken) {
        let Some(task) = self.get_task(task_id) else {
            return;
        };

        let registry = self.build_task_registry(&task);
        let system_prompt = self.build_system_prompt(&registry);

        let model = if self.model.is_empty() {
            self.provider.default_model().to_string()
        } else {
            self.model.clone()
        };

        let exec_registry = Arc::clone(&registry);
        let exec_opts = ExecuteToolCallsOptions {
            channel: task.origin_channel.clone(),
            chat_id: task.origin_chat_id.clone(),
            trace_id: task_id.to_string(),
            timeout: self.tool_timeout,
            max_parallel: self.max_parallel_tools,
            log_component: "subagent".to_string(),
            iteration: 0,
            on_tool_complete: None,
        };
        let execute_tools: ExecuteToolsFn = Arc::new(move |cancel, calls, iteration| {
            let registry = Arc::clone(&exec_registry);
            let mut opts = exec_opts.clone();
            opts.iteration = iteration;
            Box::pin(async move { registry.execute_tool_calls(cancel, &calls, opts).await })
        });

        let defs_registry = Arc::clone(&registry);
        let opts = RunOptions {
            provider: Arc::clone(&self.provider),
            model,
            max_iterations: self.max_iterations,
            llm_timeout: self.llm_timeout,
            chat_options: ChatOptions::new().with_max_tokens(4096).with_temperature(0.3),
            budget: None,
            messages: vec![Message::system(&system_prompt), Message::user(&task.task)],
            build_tool_defs: Some(Arc::new(move |_, _| defs_registry.definitions())),
            execute_tools: Some(execute_tools),
            hooks: Default::default(),
        };

        let outcome = iteration::run(cancel.clone(), opts).await;

        let (status, result) = match outcome {
            _ if cancel.is_cancelled() => (TaskStatus::Cancelled, "Cancelled".to_string()),
            Err(e) if e.is_cancelled() => (TaskStatus::Cancelled, "Cancelled".to_string()),
            Err(e) => (TaskStatus::Failed, format!("Error: {}", e)),
            Ok(run) => (TaskStatus::Completed, run.final_content),
        };

        let label = {
            let mut state = self.state.write().expect("state lock");
            let label = if let Some(task) = state.tasks.get_mut(task_id) {
                task.status = status;
                task.result = result.clone();
                task.finished_at = now_millis();
                task.display_label().to_string()
            } else {
                task_id.to_string()
            };
            state.cancels.remove(task_id);
            cleanup_locked(&mut state, now_millis());
            label
        };

        info!(
            task_id = task_id,
            status = %status,
            result_preview = %truncate(&result, 120),
            "subagent task finished"
        );

        if let Some(bus) = &self.bus {
            let (event, state_word) = match status {
                TaskStatus::Cancelled => ("cancelled", "cancelled"),
                TaskStatus::Failed => ("failed", "failed"),
                _ => ("complete", "completed"),
            };
            let content = format!("Task '{}' {}.\n\nResult:\n{}", label, state_word, result);
            bus.publish_inbound(
                InboundMessage::system(
                    &format!("subagent:{}", task_id),
                    &task.origin_channel,
                    &task.origin_chat_id,
                    &content,
                )
                .with_metadata("subagent_event", event)
                .with_metadata("subagent_task_id", task_id),
            );
        }
    }

    fn build_task_registry(&self, task: &SubagentTask) -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new());
        if let Some(builder) = self.tool_builder.read().expect("tool builder lock").as_ref() {
            for tool in builder() {
                registry.register(tool);
            }
        }
        if let Some(bus) = &self.bus {
            registry.register(Arc::new(SubagentReportTool::new(
                bus.clone(),
                &task.id,
                &task.label,
                &task.origin_channel,
                &task.origin_chat_id,
            )));
        }
        registry
    }

    fn build_system_prompt(&self, registry: &ToolRegistry) -> String {
        let mut parts = vec![
            "# yoctoclaw subagent".to_string(),
            "You are a background subagent working for the main yoctoclaw agent.".to_string(),
            "\nRules:".to_string(),
            "1. Use tools when you need to perform an action.".to_string(),
            "2. Do NOT message the end user. Use `subagent_report` to communicate with the main agent."
                .to_string(),
            "3. When finished, provide a clear result and include any artifact file paths."
                .to_string(),
            format!("\nWorkspace: {}", self.workspace.display()),
        ];

        let summaries = registry.summaries();
        if !summaries.is_empty() {
            parts.push(format!(
                "\n## Available Tools\n\n\
                 **CRITICAL**: You MUST use tools to perform actions. Do NOT pretend to execute commands.\n\n\
                 You have access to the following tools:\n\n{}",
                summaries.join("\n")
            ));
        }

        if let Some(skills) = self.skills_summary.read().expect("skills lock").as_ref() {
            if !skills.is_empty() {
                parts.push(format!(
                    "\n## Skills\n\nThe following skills extend your capabilities.\n\n{}",
                    skills
                ));
            }
        }

        parts.join("\n")
    }
}

/// Evict terminal tasks past the TTL, then oldest terminal tasks beyond the
/// cap. Callers hold the write lock.
fn cleanup_locked(state: &mut ManagerState, now: i64) {
    let ttl_millis = state.completed_ttl.as_millis() as i64;

    let expired: Vec<String> = state
        .tasks
        .values()
        .filter(|t| t.status.is_terminal() && t.finished_at > 0)
        .filter(|t| now - t.finished_at > ttl_millis)
        .map(|t| t.id.clone())
        .collect();
    for id in expired {
        state.tasks.remove(&id);
        state.cancels.remove(&id);
    }

    if state.max_tasks == 0 || state.tasks.len() <= state.max_tasks {
        return;
    }

    let mut terminal: Vec<(i64, String)> = state
        .tasks
        .values()
        .filter(|t| t.status.is_terminal())
        .map(|t| (t.created_at, t.id.clone()))
        .collect();
    terminal.sort();

    let mut excess = state.tasks.len().saturating_sub(state.max_tasks);
    for (_, id) in terminal {
        if excess == 0 {
            break;
        }
        state.tasks.remove(&id);
        state.cancels.remove(&id);
        excess -= 1;
    }

    if state.tasks.len() > state.max_tasks {
        warn!(
            tasks = state.tasks.len(),
            max = state.max_tasks,
            "task cap exceeded by running tasks; none evicted"
        );
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
