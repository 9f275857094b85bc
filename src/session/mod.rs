//! Session module - conversation state management
//!
//! In-memory session storage with optional JSON-file persistence, exposing
//! the history/summary contract the agent core consumes: `get_history`,
//! `get_summary`, `append`, `append_full`, `set_summary`, `truncate_history`
//! and `save`.

pub mod types;

pub use types::{Message, Role, Session, ToolCall};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::Config;
use crate::error::Result;

/// Session manager for storing and retrieving conversation sessions.
///
/// Safe to clone and share across tasks; all clones see the same cache.
/// Sessions are keyed by strings like `"telegram:chat123"`.
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    storage_path: Option<PathBuf>,
}

impl SessionManager {
    /// Create a manager persisting sessions under `~/.yoctoclaw/sessions/`.
    pub fn new() -> Result<Self> {
        let storage_path = Config::dir().join("sessions");
        std::fs::create_dir_all(&storage_path)?;
        Ok(Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            storage_path: Some(storage_path),
        })
    }

    /// Create an in-memory manager without persistence (tests, ephemeral runs).
    pub fn new_memory() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            storage_path: None,
        }
    }

    /// Create a manager with a custom storage directory.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            storage_path: Some(path),
        })
    }

    /// Get an existing session or create a new empty one.
    pub async fn get_or_create(&self, key: &str) -> Result<Session> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(key) {
                return Ok(session.clone());
            }
        }

        if let Some(session) = self.load_from_disk(key).await? {
            return Ok(session);
        }

        let session = Session::new(key);
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .entry(key.to_string())
            .or_insert(session)
            .clone())
    }

    /// Get a session without creating it.
    pub async fn get(&self, key: &str) -> Result<Option<Session>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(key) {
                return Ok(Some(session.clone()));
            }
        }
        self.load_from_disk(key).await
    }

    /// The full message history for a session (empty when unknown).
    pub async fn get_history(&self, key: &str) -> Vec<Message> {
        let sessions = self.sessions.read().await;
        sessions
            .get(key)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// The running summary for a session, if any.
    pub async fn get_summary(&self, key: &str) -> Option<String> {
        let sessions = self.sessions.read().await;
        sessions.get(key).and_then(|s| s.summary.clone())
    }

    /// Append a plain message by role name. Creates the session if missing.
    pub async fn append(&self, key: &str, role: &str, content: &str) {
        let mut msg = Message::user(content);
        msg.role = Role::from_str_lossy(role);
        self.append_full(key, msg).await;
    }

    /// Append a full message (tool calls / tool results included).
    /// Creates the session if missing.
    pub async fn append_full(&self, key: &str, message: Message) {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(key.to_string())
            .or_insert_with(|| Session::new(key))
            .add_message(message);
    }

    /// Replace the running summary for a session. Creates it if missing.
    pub async fn set_summary(&self, key: &str, summary: &str) {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(key.to_string())
            .or_insert_with(|| Session::new(key))
            .set_summary(summary);
    }

    /// Keep only the last `keep_last_n` messages of a session.
    pub async fn truncate_history(&self, key: &str, keep_last_n: usize) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(key) {
            session.truncate_history(keep_last_n);
        }
    }

    /// Save a session to the cache and, when enabled, to disk.
    pub async fn save(&self, session: &Session) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session.key.clone(), session.clone());
        }

        if let Some(ref storage_path) = self.storage_path {
            let file_path = storage_path.join(format!("{}.json", sanitize_key(&session.key)));
            let content = serde_json::to_string_pretty(session)?;
            tokio::fs::write(&file_path, content).await?;
        }

        Ok(())
    }

    /// Persist the current cached state of a session, if present.
    pub async fn persist(&self, key: &str) -> Result<()> {
        let session = {
            let sessions = self.sessions.read().await;
            sessions.get(key).cloned()
        };
        if let Some(session) = session {
            self.save(&session).await?;
        }
        Ok(())
    }

    /// Delete a session from cache and disk.
    pub async fn delete(&self, key: &str) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            sessions.remove(key);
        }
        if let Some(ref storage_path) = self.storage_path {
            let file_path = storage_path.join(format!("{}.json", sanitize_key(key)));
            if file_path.exists() {
                tokio::fs::remove_file(&file_path).await?;
            }
        }
        Ok(())
    }

    async fn load_from_disk(&self, key: &str) -> Result<Option<Session>> {
        let Some(ref storage_path) = self.storage_path else {
            return Ok(None);
        };
        let file_path = storage_path.join(format!("{}.json", sanitize_key(key)));
        if !file_path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&file_path).await?;
        let session: Session = serde_json::from_str(&content)?;
        let mut sessions = self.sessions.write().await;
        sessions.insert(key.to_string(), session.clone());
        Ok(Some(session))
    }
}

impl Clone for SessionManager {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
            storage_path: self.storage_path.clone(),
        }
    }
}

/// Make a session key safe to use as a filename.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_create() {
        let manager = SessionManager::new_memory();
        let session = manager.get_or_create("test-session").await.unwrap();
        assert_eq!(session.key, "test-session");
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_append_and_history() {
        let manager = SessionManager::new_memory();
        manager.append("s1", "user", "Hello").await;
        manager.append("s1", "assistant", "Hi!").await;

        let history = manager.get_history("s1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_append_full_preserves_tool_calls() {
        let manager = SessionManager::new_memory();
        let msg = Message::assistant_with_tools(
            "",
            vec![ToolCall::new("tc1", "echo", r#"{"message":"x"}"#)],
        );
        manager.append_full("s1", msg).await;
        manager.append_full("s1", Message::tool_result("tc1", "x")).await;

        let history = manager.get_history("s1").await;
        assert!(history[0].has_tool_calls());
        assert_eq!(history[1].tool_call_id.as_deref(), Some("tc1"));
    }

    #[tokio::test]
    async fn test_summary_roundtrip() {
        let manager = SessionManager::new_memory();
        assert!(manager.get_summary("s1").await.is_none());
        manager.set_summary("s1", "summary so far").await;
        assert_eq!(manager.get_summary("s1").await.as_deref(), Some("summary so far"));
    }

    #[tokio::test]
    async fn test_truncate_history() {
        let manager = SessionManager::new_memory();
        for i in 0..8 {
            manager.append("s1", "user", &format!("m{}", i)).await;
        }
        manager.truncate_history("s1", 3).await;
        let history = manager.get_history("s1").await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "m5");
    }

    #[tokio::test]
    async fn test_history_of_unknown_session_is_empty() {
        let manager = SessionManager::new_memory();
        assert!(manager.get_history("missing").await.is_empty());
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = std::env::temp_dir().join(format!("yocto-sess-{}", uuid::Uuid::new_v4()));
        let manager = SessionManager::with_path(dir.clone()).unwrap();

        let mut session = manager.get_or_create("telegram:42").await.unwrap();
        session.add_message(Message::user("persisted"));
        manager.save(&session).await.unwrap();

        // A fresh manager over the same directory reloads it from disk.
        let manager2 = SessionManager::with_path(dir.clone()).unwrap();
        let reloaded = manager2.get("telegram:42").await.unwrap().unwrap();
        assert_eq!(reloaded.messages.len(), 1);
        assert_eq!(reloaded.messages[0].content, "persisted");

        tokio::fs::remove_dir_all(dir).await.ok();
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("telegram:chat/1"), "telegram_chat_1");
        assert_eq!(sanitize_key("plain-key_1.x"), "plain-key_1.x");
    }
}
