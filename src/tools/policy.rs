//! Tool execution policy.
//!
//! Controls which tools may execute:
//! - `enabled == false`: no policy checks.
//! - The deny list always blocks matching tools, and is checked before allow.
//! - A non-empty allow list restricts execution to listed tools.
//!
//! Names are matched case-insensitively after trimming.

use std::collections::HashSet;

use crate::error::{Result, YoctoError};

/// Allow/deny policy applied by the registry before tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolExecutionPolicy {
    pub enabled: bool,
    allow: HashSet<String>,
    deny: HashSet<String>,
}

impl ToolExecutionPolicy {
    /// Build a policy from raw name lists. Empty names are ignored.
    pub fn new(enabled: bool, allow: &[&str], deny: &[&str]) -> Self {
        let normalize = |names: &[&str]| {
            names
                .iter()
                .map(|n| n.trim().to_lowercase())
                .filter(|n| !n.is_empty())
                .collect::<HashSet<String>>()
        };
        Self {
            enabled,
            allow: normalize(allow),
            deny: normalize(deny),
        }
    }

    /// Check whether `tool_name` may execute under this policy.
    pub fn check(&self, tool_name: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let name = tool_name.trim().to_lowercase();
        if name.is_empty() {
            return Err(YoctoError::Tool("tool name is empty".into()));
        }

        if self.deny.contains(&name) {
            return Err(YoctoError::Tool(format!(
                "tool {} is blocked by policy",
                tool_name
            )));
        }

        if !self.allow.is_empty() && !self.allow.contains(&name) {
            return Err(YoctoError::Tool(format!(
                "tool {} is not allowed by policy",
                tool_name
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_policy_allows_everything() {
        let policy = ToolExecutionPolicy::new(false, &[], &["danger"]);
        assert!(policy.check("danger").is_ok());
    }

    #[test]
    fn test_deny_blocks() {
        let policy = ToolExecutionPolicy::new(true, &[], &["danger"]);
        let err = policy.check("danger").unwrap_err();
        assert!(err.to_string().contains("blocked by policy"));
    }

    #[test]
    fn test_allow_list_restricts() {
        let policy = ToolExecutionPolicy::new(true, &["safe"], &[]);
        assert!(policy.check("safe").is_ok());
        let err = policy.check("other").unwrap_err();
        assert!(err.to_string().contains("not allowed by policy"));
    }

    #[test]
    fn test_deny_checked_before_allow() {
        let policy = ToolExecutionPolicy::new(true, &["both"], &["both"]);
        let err = policy.check("both").unwrap_err();
        assert!(err.to_string().contains("blocked by policy"));
    }

    #[test]
    fn test_matching_is_case_insensitive_and_trimmed() {
        let policy = ToolExecutionPolicy::new(true, &[], &[" Danger "]);
        assert!(policy.check("DANGER").is_err());
        assert!(policy.check("danger").is_err());
        assert!(policy.check("safe").is_ok());
    }

    #[test]
    fn test_empty_name_rejected() {
        let policy = ToolExecutionPolicy::new(true, &[], &[]);
        assert!(policy.check("  ").is_err());
    }

    #[test]
    fn test_empty_entries_ignored() {
        let policy = ToolExecutionPolicy::new(true, &["", "  "], &[]);
        // Allow list is effectively empty, so everything passes.
        assert!(policy.check("anything").is_ok());
    }
}
