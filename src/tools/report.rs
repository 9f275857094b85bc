//! Subagent report tool.
//!
//! Lets a subagent send internal updates to the main agent by publishing an
//! inbound system message routed back to the origin chat. This tool never
//! messages the end user directly.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::bus::{InboundMessage, MessageBus};
use crate::error::{Result, YoctoError};
use crate::tools::Tool;

/// Publishes progress/note/warning/error/complete events from a subagent to
/// the bus as inbound system messages carrying `subagent_event` and
/// `subagent_task_id` metadata.
pub struct SubagentReportTool {
    bus: MessageBus,
    task_id: String,
    label: String,
    origin_channel: String,
    origin_chat_id: String,
}

impl SubagentReportTool {
    /// Create a report tool bound to one subagent task.
    pub fn new(
        bus: MessageBus,
        task_id: &str,
        label: &str,
        origin_channel: &str,
        origin_chat_id: &str,
    ) -> Self {
        Self {
            bus,
            task_id: task_id.to_string(),
            label: label.to_string(),
            origin_channel: origin_channel.to_string(),
            origin_chat_id: origin_chat_id.to_string(),
        }
    }
}

#[async_trait]
impl Tool for SubagentReportTool {
    fn name(&self) -> &str {
        "subagent_report"
    }

    fn description(&self) -> &str {
        "Report progress or intermediate results back to the main agent (internal only). This does NOT message the user."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The update to send to the main agent"
                },
                "event": {
                    "type": "string",
                    "description": "Event type: progress, note, warning, error, complete",
                    "enum": ["progress", "note", "warning", "error", "complete"]
                },
                "artifacts": {
                    "type": "array",
                    "description": "Optional file paths produced by the subagent (images, outputs, etc.)",
                    "items": {"type": "string"}
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, _cancel: CancellationToken, args: Value) -> Result<String> {
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| YoctoError::Tool("content is required".into()))?;

        let event = args
            .get("event")
            .and_then(|v| v.as_str())
            .filter(|e| !e.is_empty())
            .unwrap_or("progress");

        let artifacts: Vec<&str> = args
            .get("artifacts")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let mut msg_content = content.to_string();
        if !artifacts.is_empty() {
            msg_content.push_str("\n\nArtifacts:\n");
            for path in &artifacts {
                msg_content.push_str("- ");
                msg_content.push_str(path);
                msg_content.push('\n');
            }
            msg_content = msg_content.trim_end().to_string();
        }

        let mut inbound = InboundMessage::system(
            &format!("subagent:{}", self.task_id),
            &self.origin_channel,
            &self.origin_chat_id,
            &msg_content,
        )
        .with_metadata("subagent_event", event)
        .with_metadata("subagent_task_id", &self.task_id);
        if !self.label.is_empty() {
            inbound = inbound.with_metadata("subagent_label", &self.label);
        }
        self.bus.publish_inbound(inbound);

        Ok("Reported to main agent".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(bus: &MessageBus) -> SubagentReportTool {
        SubagentReportTool::new(bus.clone(), "subagent-3", "imggen", "telegram", "chat9")
    }

    #[tokio::test]
    async fn test_report_publishes_system_inbound() {
        let bus = MessageBus::new();
        let result = tool(&bus)
            .execute(
                CancellationToken::new(),
                json!({"content": "halfway there", "event": "note"}),
            )
            .await
            .unwrap();
        assert_eq!(result, "Reported to main agent");

        let cancel = CancellationToken::new();
        let msg = bus.consume_inbound(&cancel).await.unwrap();
        assert_eq!(msg.channel, "system");
        assert_eq!(msg.sender_id, "subagent:subagent-3");
        assert_eq!(msg.chat_id, "telegram:chat9");
        assert_eq!(msg.content, "halfway there");
        assert_eq!(msg.metadata.get("subagent_event").unwrap(), "note");
        assert_eq!(msg.metadata.get("subagent_task_id").unwrap(), "subagent-3");
        assert_eq!(msg.metadata.get("subagent_label").unwrap(), "imggen");
    }

    #[tokio::test]
    async fn test_report_defaults_to_progress() {
        let bus = MessageBus::new();
        tool(&bus)
            .execute(CancellationToken::new(), json!({"content": "tick"}))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let msg = bus.consume_inbound(&cancel).await.unwrap();
        assert_eq!(msg.metadata.get("subagent_event").unwrap(), "progress");
    }

    #[tokio::test]
    async fn test_report_renders_artifacts() {
        let bus = MessageBus::new();
        tool(&bus)
            .execute(
                CancellationToken::new(),
                json!({"content": "made files", "artifacts": ["/tmp/a.png", "/tmp/b.png"]}),
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let msg = bus.consume_inbound(&cancel).await.unwrap();
        assert!(msg.content.contains("made files"));
        assert!(msg.content.contains("\n\nArtifacts:\n"));
        assert!(msg.content.contains("- /tmp/a.png"));
        assert!(msg.content.contains("- /tmp/b.png"));
        assert!(!msg.content.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_report_requires_content() {
        let bus = MessageBus::new();
        let err = tool(&bus)
            .execute(CancellationToken::new(), json!({"event": "progress"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("content is required"));
    }
}
