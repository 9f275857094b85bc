//! Context builder for agent conversations.
//!
//! Assembles the system prompt (identity, workspace, tool summaries, optional
//! skills section) and the full message array for an LLM call.

use crate::session::Message;

/// Default system prompt for the YoctoClaw agent.
const DEFAULT_SYSTEM_PROMPT: &str = "You are YoctoClaw, a lightweight personal AI assistant.\n\n\
You have access to tools to help accomplish tasks. Use them when needed.\n\n\
Be concise but helpful. Focus on completing the user's request efficiently.";

/// Builder for constructing conversation context for LLM calls.
pub struct ContextBuilder {
    system_prompt: String,
    workspace: Option<String>,
    tool_summaries: Vec<String>,
    skills_prompt: Option<String>,
}

impl ContextBuilder {
    /// Create a builder with the default system prompt.
    pub fn new() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            workspace: None,
            tool_summaries: Vec::new(),
            skills_prompt: None,
        }
    }

    /// Replace the base system prompt.
    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    /// Record the workspace path to mention in the system prompt.
    pub fn with_workspace(mut self, workspace: &str) -> Self {
        self.workspace = Some(workspace.to_string());
        self
    }

    /// Record tool summaries for the "Available Tools" section.
    pub fn with_tool_summaries(mut self, summaries: Vec<String>) -> Self {
        self.tool_summaries = summaries;
        self
    }

    /// Append a skills section to the system prompt.
    pub fn with_skills(mut self, skills_content: &str) -> Self {
        self.skills_prompt = Some(skills_content.to_string());
        self
    }

    /// Build the system message with all configured content.
    pub fn build_system_message(&self) -> Message {
        let mut content = self.system_prompt.clone();
        if let Some(ref workspace) = self.workspace {
            content.push_str(&format!("\n\nWorkspace: {}", workspace));
        }
        if !self.tool_summaries.is_empty() {
            content.push_str("\n\n## Available Tools\n\n");
            content.push_str(&self.tool_summaries.join("\n"));
        }
        if let Some(ref skills) = self.skills_prompt {
            content.push_str("\n\n## Available Skills\n\n");
            content.push_str(skills);
        }
        Message::system(&content)
    }

    /// Build the full message list for an LLM call: system message, optional
    /// summary of compacted context, history, then the new user input (when
    /// non-empty).
    pub fn build_messages(
        &self,
        history: Vec<Message>,
        summary: Option<&str>,
        user_input: &str,
    ) -> Vec<Message> {
        let mut messages = vec![self.build_system_message()];
        if let Some(summary) = summary.filter(|s| !s.is_empty()) {
            messages.push(Message::system(&format!(
                "Summary of earlier conversation:\n{}",
                summary
            )));
        }
        messages.extend(history);
        if !user_input.is_empty() {
            messages.push(Message::user(user_input));
        }
        messages
    }

    /// The current base system prompt.
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
