use serde::{Deserialize, Serialize};

/// A command or chat line received from an operator on some channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp_ms: i64,
}

impl InboundMessage {
    pub fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            metadata: serde_json::Value::Null,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Conversation identity: the unit of watch admission control.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl OutboundMessage {
    pub fn new(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            reply_to: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Reply on the same channel and chat an inbound message came from.
    pub fn reply(to: &InboundMessage, content: &str) -> Self {
        Self::new(&to.channel, &to.chat_id, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_combines_channel_and_chat() {
        let msg = InboundMessage::new("telegram", "42", "-100123", "/stop");
        assert_eq!(msg.session_key(), "telegram:-100123");
    }

    #[test]
    fn test_reply_targets_origin_chat() {
        let msg = InboundMessage::new("telegram", "42", "777", "/start");
        let out = OutboundMessage::reply(&msg, "hi");
        assert_eq!(out.channel, "telegram");
        assert_eq!(out.chat_id, "777");
        assert_eq!(out.content, "hi");
        assert!(out.reply_to.is_none());
    }
}
