//! Deterministic message payload budgeting.
//!
//! `apply_message_budget` trims a message array to fit provider context
//! limits before a chat call. It is a pure function: the input slice is never
//! mutated, and the same inputs always produce the same output.
//!
//! Character counts are Unicode scalar counts and all clipping is
//! char-boundary safe.

use crate::session::{Message, Role};

const DEFAULT_TRUNCATION_MARKER: &str = "... [truncated]";

/// Payload limits applied before provider calls. A limit of 0 is unbounded.
#[derive(Debug, Clone, Default)]
pub struct MessageBudget {
    /// Maximum number of messages kept.
    pub max_messages: usize,
    /// Maximum total characters across all message contents.
    pub max_total_chars: usize,
    /// Maximum characters per message content.
    pub max_message_chars: usize,
    /// Maximum characters for tool-role messages (falls back to
    /// `max_message_chars` when 0).
    pub max_tool_message_chars: usize,
    /// Marker appended to clipped content. Empty = default marker.
    pub truncation_marker: String,
}

impl MessageBudget {
    /// Build a conservative default budget from an estimated model context
    /// window size in tokens.
    pub fn from_context_window(context_window: usize) -> Self {
        let context_window = if context_window == 0 { 8192 } else { context_window };

        let max_total_chars = (context_window * 4 * 80 / 100).max(32_000);
        let max_message_chars = (max_total_chars / 3).max(4_000);
        let max_tool_message_chars = (max_message_chars / 2).max(2_000);

        Self {
            max_messages: 200,
            max_total_chars,
            max_message_chars,
            max_tool_message_chars,
            truncation_marker: DEFAULT_TRUNCATION_MARKER.to_string(),
        }
    }

    /// Whether any limit is active.
    pub fn enabled(&self) -> bool {
        self.max_messages > 0
            || self.max_total_chars > 0
            || self.max_message_chars > 0
            || self.max_tool_message_chars > 0
    }

    fn marker(&self) -> &str {
        if self.truncation_marker.is_empty() {
            DEFAULT_TRUNCATION_MARKER
        } else {
            &self.truncation_marker
        }
    }
}

/// What changed during payload budgeting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBudgetStats {
    pub input_messages: usize,
    pub output_messages: usize,
    pub chars_before: usize,
    pub chars_after: usize,
    pub truncated_messages: usize,
    pub dropped_messages: usize,
}

impl MessageBudgetStats {
    /// Whether budgeting changed the payload at all.
    pub fn changed(&self) -> bool {
        self.truncated_messages > 0
            || self.dropped_messages > 0
            || self.chars_after != self.chars_before
            || self.output_messages != self.input_messages
    }
}

/// Trim message payload size before sending to a provider.
///
/// Steps, in order: clip individual message contents, trim the message count
/// (keeping system messages and the newest others), greedily trim total
/// characters (newest non-system first), and finally clip the newest
/// non-system message to close any remaining overflow.
pub fn apply_message_budget(
    messages: &[Message],
    budget: &MessageBudget,
) -> (Vec<Message>, MessageBudgetStats) {
    let mut stats = MessageBudgetStats {
        input_messages: messages.len(),
        chars_before: sum_message_chars(messages),
        ..Default::default()
    };

    if messages.is_empty() || !budget.enabled() {
        stats.output_messages = messages.len();
        stats.chars_after = stats.chars_before;
        return (messages.to_vec(), stats);
    }

    let marker = budget.marker();
    let mut trimmed: Vec<Message> = messages.to_vec();

    for msg in trimmed.iter_mut() {
        let limit = if msg.role == Role::Tool && budget.max_tool_message_chars > 0 {
            budget.max_tool_message_chars
        } else {
            budget.max_message_chars
        };
        if limit > 0 && char_len(&msg.content) > limit {
            msg.content = truncate_with_marker(&msg.content, limit, marker);
            stats.truncated_messages += 1;
        }
    }

    if budget.max_messages > 0 && trimmed.len() > budget.max_messages {
        let next = keep_system_and_latest(&trimmed, budget.max_messages);
        stats.dropped_messages += trimmed.len() - next.len();
        trimmed = next;
    }

    if budget.max_total_chars > 0 && sum_message_chars(&trimmed) > budget.max_total_chars {
        let next = keep_within_total_chars(&trimmed, budget.max_total_chars);
        stats.dropped_messages += trimmed.len() - next.len();
        trimmed = next;

        // Final fit pass: if still over budget, clip the newest non-system
        // message to make room.
        let total = sum_message_chars(&trimmed);
        if total > budget.max_total_chars {
            let overflow = total - budget.max_total_chars;
            for msg in trimmed.iter_mut().rev() {
                if msg.role == Role::System {
                    continue;
                }
                let len = char_len(&msg.content);
                let target = len.saturating_sub(overflow).max(1);
                if target < len {
                    msg.content = truncate_with_marker(&msg.content, target, marker);
                    stats.truncated_messages += 1;
                }
                break;
            }
        }
    }

    stats.output_messages = trimmed.len();
    stats.chars_after = sum_message_chars(&trimmed);
    (trimmed, stats)
}

/// Keep all system messages (up to the cap), filling the remaining slots with
/// the newest non-system messages, preserving original order.
fn keep_system_and_latest(messages: &[Message], max_messages: usize) -> Vec<Message> {
    if max_messages == 0 || messages.len() <= max_messages {
        return messages.to_vec();
    }

    let mut system_idx = Vec::new();
    let mut other_idx = Vec::new();
    for (i, m) in messages.iter().enumerate() {
        if m.role == Role::System {
            system_idx.push(i);
        } else {
            other_idx.push(i);
        }
    }

    let mut keep_idx: Vec<usize> = if system_idx.len() >= max_messages {
        system_idx[..max_messages].to_vec()
    } else {
        let mut keep = system_idx;
        let slots = max_messages - keep.len();
        keep.extend(other_idx.iter().rev().take(slots));
        keep
    };

    keep_idx.sort_unstable();
    keep_idx.into_iter().map(|i| messages[i].clone()).collect()
}

/// Keep all system messages, then walk non-system messages newest to oldest,
/// greedily selecting those that fit the remaining character budget. The
/// newest non-system message is force-kept when nothing else fits.
fn keep_within_total_chars(messages: &[Message], max_total_chars: usize) -> Vec<Message> {
    if max_total_chars == 0 || sum_message_chars(messages) <= max_total_chars {
        return messages.to_vec();
    }

    let mut keep = vec![false; messages.len()];
    let mut total_system = 0;
    let mut non_system_count = 0;
    for (i, m) in messages.iter().enumerate() {
        if m.role == Role::System {
            keep[i] = true;
            total_system += char_len(&m.content);
        } else {
            non_system_count += 1;
        }
    }

    let remaining = max_total_chars.saturating_sub(total_system);

    let mut used = 0;
    let mut selected_non_system = 0;
    let mut latest_non_system = None;
    for i in (0..messages.len()).rev() {
        if messages[i].role == Role::System {
            continue;
        }
        if latest_non_system.is_none() {
            latest_non_system = Some(i);
        }
        let content_len = char_len(&messages[i].content);
        if used + content_len <= remaining {
            keep[i] = true;
            used += content_len;
            selected_non_system += 1;
        }
    }

    // Preserve conversational continuity even when nothing fits.
    if selected_non_system == 0 && non_system_count > 0 {
        if let Some(i) = latest_non_system {
            keep[i] = true;
        }
    }

    messages
        .iter()
        .enumerate()
        .filter(|(i, _)| keep[*i])
        .map(|(_, m)| m.clone())
        .collect()
}

fn sum_message_chars(messages: &[Message]) -> usize {
    messages.iter().map(|m| char_len(&m.content)).sum()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Clip `content` to `limit` characters, appending `marker`. When the marker
/// itself does not fit, the marker is truncated instead.
fn truncate_with_marker(content: &str, limit: usize, marker: &str) -> String {
    if limit == 0 {
        return String::new();
    }
    if char_len(content) <= limit {
        return content.to_string();
    }
    let marker = if marker.is_empty() {
        DEFAULT_TRUNCATION_MARKER
    } else {
        marker
    };
    let marker_len = char_len(marker);
    if marker_len >= limit {
        return marker.chars().take(limit).collect();
    }
    let keep = limit - marker_len;
    let mut out: String = content.chars().take(keep).collect();
    out.push_str(marker);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: &str) -> Message {
        let mut m = Message::user(content);
        m.role = role;
        m
    }

    #[test]
    fn test_disabled_budget_is_identity() {
        let messages = vec![msg(Role::User, "hello"), msg(Role::Assistant, "world")];
        let (out, stats) = apply_message_budget(&messages, &MessageBudget::default());
        assert_eq!(out.len(), 2);
        assert!(!stats.changed());
        assert_eq!(stats.chars_before, stats.chars_after);
    }

    #[test]
    fn test_never_mutates_input() {
        let messages = vec![msg(Role::User, &"a".repeat(100))];
        let budget = MessageBudget {
            max_message_chars: 20,
            ..Default::default()
        };
        let (out, _) = apply_message_budget(&messages, &budget);
        assert_eq!(messages[0].content.len(), 100);
        assert!(out[0].content.chars().count() <= 20);
    }

    #[test]
    fn test_per_message_clip_appends_marker() {
        let messages = vec![msg(Role::User, &"x".repeat(50))];
        let budget = MessageBudget {
            max_message_chars: 30,
            ..Default::default()
        };
        let (out, stats) = apply_message_budget(&messages, &budget);
        assert_eq!(out[0].content.chars().count(), 30);
        assert!(out[0].content.ends_with("... [truncated]"));
        assert_eq!(stats.truncated_messages, 1);
    }

    #[test]
    fn test_tool_messages_use_tool_limit() {
        let messages = vec![
            msg(Role::Tool, &"t".repeat(100)),
            msg(Role::User, &"u".repeat(100)),
        ];
        let budget = MessageBudget {
            max_message_chars: 80,
            max_tool_message_chars: 20,
            ..Default::default()
        };
        let (out, _) = apply_message_budget(&messages, &budget);
        assert_eq!(out[0].content.chars().count(), 20);
        assert_eq!(out[1].content.chars().count(), 80);
    }

    #[test]
    fn test_marker_longer_than_limit_is_truncated_marker() {
        let out = truncate_with_marker(&"y".repeat(100), 5, "... [truncated]");
        assert_eq!(out, "... [");
    }

    #[test]
    fn test_max_messages_keeps_system_and_newest() {
        let mut messages = vec![msg(Role::System, "sys")];
        for i in 0..10 {
            messages.push(msg(Role::User, &format!("u{}", i)));
        }
        let budget = MessageBudget {
            max_messages: 4,
            ..Default::default()
        };
        let (out, stats) = apply_message_budget(&messages, &budget);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].role, Role::System);
        assert_eq!(out[1].content, "u7");
        assert_eq!(out[2].content, "u8");
        assert_eq!(out[3].content, "u9");
        assert_eq!(stats.dropped_messages, 7);
    }

    #[test]
    fn test_max_messages_all_system_cap() {
        let messages: Vec<Message> = (0..5).map(|i| msg(Role::System, &format!("s{}", i))).collect();
        let budget = MessageBudget {
            max_messages: 3,
            ..Default::default()
        };
        let (out, _) = apply_message_budget(&messages, &budget);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].content, "s0");
        assert_eq!(out[2].content, "s2");
    }

    #[test]
    fn test_total_chars_keeps_newest_and_system() {
        // Spec scenario: system + two 40-char user messages, 50-char budget.
        let messages = vec![
            msg(Role::System, "sys"),
            msg(Role::User, &"a".repeat(40)),
            msg(Role::User, &"b".repeat(40)),
        ];
        let budget = MessageBudget {
            max_total_chars: 50,
            max_message_chars: 100,
            ..Default::default()
        };
        let (out, stats) = apply_message_budget(&messages, &budget);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, Role::System);
        assert!(out[1].content.contains('b'));
        assert!(stats.chars_after <= 50);
    }

    #[test]
    fn test_total_chars_forces_newest_non_system() {
        // Nothing fits, but the newest non-system message must survive.
        let messages = vec![msg(Role::System, &"s".repeat(30)), msg(Role::User, &"u".repeat(100))];
        let budget = MessageBudget {
            max_total_chars: 40,
            ..Default::default()
        };
        let (out, _) = apply_message_budget(&messages, &budget);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].role, Role::User);
        // Final-fit pass clips it down to budget.
        let total: usize = out.iter().map(|m| m.content.chars().count()).sum();
        assert!(total <= 40);
    }

    #[test]
    fn test_output_invariants() {
        let messages = vec![
            msg(Role::System, "keep me"),
            msg(Role::User, &"a".repeat(500)),
            msg(Role::Assistant, &"b".repeat(500)),
            msg(Role::User, &"c".repeat(500)),
        ];
        let budget = MessageBudget {
            max_messages: 3,
            max_total_chars: 300,
            max_message_chars: 400,
            ..Default::default()
        };
        let (out, stats) = apply_message_budget(&messages, &budget);

        assert!(stats.output_messages <= stats.input_messages);
        assert!(stats.chars_after <= stats.chars_before);
        // System messages preserved, at least one non-system survivor.
        assert!(out.iter().any(|m| m.role == Role::System));
        assert!(out.iter().any(|m| m.role != Role::System));
    }

    #[test]
    fn test_idempotent_at_output_level() {
        let messages = vec![
            msg(Role::System, "sys"),
            msg(Role::User, &"a".repeat(300)),
            msg(Role::User, &"b".repeat(300)),
        ];
        let budget = MessageBudget {
            max_total_chars: 200,
            max_message_chars: 250,
            ..Default::default()
        };
        let (once, _) = apply_message_budget(&messages, &budget);
        let (twice, _) = apply_message_budget(&once, &budget);
        let flatten = |ms: &[Message]| {
            ms.iter()
                .map(|m| format!("{}:{}", m.role, m.content))
                .collect::<Vec<_>>()
        };
        assert_eq!(flatten(&once), flatten(&twice));
    }

    #[test]
    fn test_stats_changed() {
        let mut stats = MessageBudgetStats::default();
        assert!(!stats.changed());
        stats.truncated_messages = 1;
        assert!(stats.changed());
    }

    #[test]
    fn test_from_context_window_derivation() {
        let b = MessageBudget::from_context_window(128_000);
        assert_eq!(b.max_total_chars, 128_000 * 4 * 80 / 100);
        assert_eq!(b.max_message_chars, b.max_total_chars / 3);
        assert_eq!(b.max_tool_message_chars, b.max_message_chars / 2);
        assert_eq!(b.max_messages, 200);
        assert!(b.enabled());
    }

    #[test]
    fn test_from_context_window_floors() {
        let b = MessageBudget::from_context_window(0);
        assert!(b.max_total_chars >= 32_000);
        assert!(b.max_message_chars >= 4_000);
        assert!(b.max_tool_message_chars >= 2_000);
    }

    #[test]
    fn test_multibyte_clip_is_char_safe() {
        let messages = vec![msg(Role::User, &"語".repeat(50))];
        let budget = MessageBudget {
            max_message_chars: 20,
            ..Default::default()
        };
        let (out, _) = apply_message_budget(&messages, &budget);
        assert_eq!(out[0].content.chars().count(), 20);
    }
}
