//! Spawn tool: the model's interface to background subagent tasks.
//!
//! Supports four actions: `spawn`, `status`, `list`, and `cancel`. Origin
//! routing comes from the reserved context keys the registry injects into
//! the args, so the tool itself holds no per-request state.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, YoctoError};
use crate::tools::registry::execution_context;
use crate::tools::subagent::{SubagentManager, SubagentTask};
use crate::tools::Tool;
use crate::utils::truncate;

/// Tool for managing background subagent tasks.
pub struct SpawnTool {
    manager: Arc<SubagentManager>,
}

impl SpawnTool {
    /// Create a spawn tool backed by the given manager.
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Manage background subagent tasks. Use action='spawn' for long multi-step work \
         (complex builds, research, generation). Use action='status' to check one task, \
         action='list' to view tasks, and action='cancel' to stop a running task."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["spawn", "status", "list", "cancel"],
                    "description": "Operation to perform. Defaults to 'spawn' if omitted."
                },
                "task": {
                    "type": "string",
                    "description": "Task for subagent to complete (required for action='spawn')"
                },
                "label": {
                    "type": "string",
                    "description": "Optional short label for the task (for display)"
                },
                "task_id": {
                    "type": "string",
                    "description": "Task ID (required for action='status' and action='cancel')"
                },
                "include_completed": {
                    "type": "boolean",
                    "description": "For action='list': include completed/failed/cancelled tasks (default false)"
                }
            }
        })
    }

    async fn execute(&self, _cancel: CancellationToken, args: Value) -> Result<String> {
        let action = args
            .get("action")
            .and_then(|v| v.as_str())
            .filter(|a| !a.is_empty())
            .unwrap_or("spawn")
            .to_lowercase();

        match action.as_str() {
            "spawn" => {
                let task = args
                    .get("task")
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| YoctoError::Tool("task is required for action=spawn".into()))?;
                let label = args.get("label").and_then(|v| v.as_str()).unwrap_or("");

                let (mut origin_channel, mut origin_chat_id) = execution_context(&args);
                if origin_channel.is_empty() {
                    origin_channel = "cli".to_string();
                }
                if origin_chat_id.is_empty() {
                    origin_chat_id = "direct".to_string();
                }

                let task_id = self
                    .manager
                    .spawn(task, label, &origin_channel, &origin_chat_id)?;
                if label.is_empty() {
                    Ok(format!("Spawned subagent (id: {}) for task: {}", task_id, task))
                } else {
                    Ok(format!(
                        "Spawned subagent '{}' (id: {}) for task: {}",
                        label, task_id, task
                    ))
                }
            }

            "status" => {
                let task_id = required_task_id(&args, "status")?;
                match self.manager.get_task(&task_id) {
                    Some(task) => Ok(format_subagent_task(&task)),
                    None => Ok(format!("Task {} not found", task_id)),
                }
            }

            "cancel" => {
                let task_id = required_task_id(&args, "cancel")?;
                match self.manager.cancel(&task_id) {
                    Ok(()) => Ok(format!("Cancellation requested for task {}", task_id)),
                    Err(YoctoError::TaskNotFound(_)) => Ok(format!("Task {} not found", task_id)),
                    Err(YoctoError::TaskNotRunning(_)) => {
                        match self.manager.get_task(&task_id) {
                            Some(task) => Ok(format!(
                                "Task {} is not running (status: {})",
                                task_id, task.status
                            )),
                            None => Ok(format!("Task {} is not running", task_id)),
                        }
                    }
                    Err(e) => Err(e),
                }
            }

            "list" => {
                let include_completed = args
                    .get("include_completed")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);

                let tasks = self.manager.list_tasks();
                if tasks.is_empty() {
                    return Ok("No subagent tasks.".to_string());
                }

                let lines: Vec<String> = tasks
                    .iter()
                    .filter(|t| include_completed || !t.status.is_terminal())
                    .map(format_subagent_task)
                    .collect();

                if lines.is_empty() {
                    if include_completed {
                        return Ok("No subagent tasks.".to_string());
                    }
                    return Ok("No running subagent tasks.".to_string());
                }

                Ok(lines.join("\n\n"))
            }

            other => Err(YoctoError::Tool(format!("unknown action: {}", other))),
        }
    }
}

fn required_task_id(args: &Value, action: &str) -> Result<String> {
    args.get("task_id")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| YoctoError::Tool(format!("task_id is required for action={}", action)))
}

fn format_subagent_task(task: &SubagentTask) -> String {
    let result = if task.result.trim().is_empty() {
        "(no result yet)".to_string()
    } else {
        truncate(&task.result, 200)
    };
    format!(
        "Task {}\nID: {}\nStatus: {}\nResult: {}",
        task.display_label(),
        task.id,
        task.status,
        result
    )
}
