//! Message types for the YoctoClaw message bus.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reserved pseudo-channel used to route internal messages (e.g. subagent
/// reports) back to an origin chat without delivering them to the end user.
pub const SYSTEM_CHANNEL: &str = "system";

/// An incoming message from a channel (Telegram, Discord, CLI, system, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// The channel this message came from (e.g. "telegram")
    pub channel: String,
    /// Unique identifier of the sender
    pub sender_id: String,
    /// Unique identifier of the chat/conversation
    pub chat_id: String,
    /// The text content of the message
    pub content: String,
    /// Attached media file paths
    #[serde(default)]
    pub media: Vec<String>,
    /// Session key for routing (format: "channel:chat_id")
    pub session_key: String,
    /// Additional metadata key-value pairs
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// An outgoing message to be delivered via a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// The channel to send this message through
    pub channel: String,
    /// The chat/conversation to send to
    pub chat_id: String,
    /// The text content to send
    pub content: String,
    /// Attached media file paths
    #[serde(default)]
    pub media: Vec<String>,
}

impl InboundMessage {
    /// Create a new inbound message. The session key defaults to
    /// `"channel:chat_id"`.
    pub fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            media: Vec::new(),
            session_key: format!("{}:{}", channel, chat_id),
            metadata: HashMap::new(),
        }
    }

    /// Create an inbound message on the system channel, routed back to the
    /// given origin. `chat_id` becomes `"<origin_channel>:<origin_chat_id>"`.
    pub fn system(sender_id: &str, origin_channel: &str, origin_chat_id: &str, content: &str) -> Self {
        let chat_id = format!("{}:{}", origin_channel, origin_chat_id);
        Self::new(SYSTEM_CHANNEL, sender_id, &chat_id, content)
    }

    /// Add a metadata key-value pair (builder pattern).
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Attach media file paths (builder pattern).
    pub fn with_media(mut self, media: Vec<String>) -> Self {
        self.media = media;
        self
    }
}

impl OutboundMessage {
    /// Create a new outbound message.
    pub fn new(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            media: Vec::new(),
        }
    }

    /// Attach media file paths (builder pattern).
    pub fn with_media(mut self, media: Vec<String>) -> Self {
        self.media = media;
        self
    }

    /// Create an outbound message as a response to an inbound message.
    pub fn reply_to(msg: &InboundMessage, content: &str) -> Self {
        Self::new(&msg.channel, &msg.chat_id, content)
    }
}
