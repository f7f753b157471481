use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A message received by a channel, as published on its inbound topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub channel: String,
    pub conversation_id: String,
    pub sender: Sender,
    pub text: String,
    /// Set by the channel when it already knows the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            conversation_id: conversation_id.into(),
            sender: Sender {
                id: sender_id.into(),
                name: None,
            },
            text: text.into(),
            session_id: None,
            message_id: None,
            metadata: Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// Filled from the topic when the payload omits it.
    #[serde(default)]
    pub channel: String,
    pub conversation_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendResult {
    pub fn sent(message_id: Option<String>) -> Self {
        Self {
            success: true,
            message_id,
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn inbound_accepts_minimal_camel_case_payload() {
        let msg: InboundMessage = serde_json::from_value(json!({
            "channel": "slack",
            "conversationId": "C1",
            "sender": {"id": "U1"},
            "text": "hello",
        }))
        .unwrap();
        assert_eq!(msg, InboundMessage::new("slack", "C1", "U1", "hello"));
    }

    #[test]
    fn failed_send_carries_error() {
        let value = serde_json::to_value(SendResult::failed("rate limited")).unwrap();
        assert_eq!(value, json!({"success": false, "error": "rate limited"}));
    }
}
