use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

/// Message type used when the publisher does not name one.
pub const DEFAULT_MESSAGE_TYPE: &str = "message";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMeta {
    #[serde(rename = "type")]
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
}

/// A payload on its way through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub payload: Value,
    pub meta: EnvelopeMeta,
}

/// Optional overrides a publisher may pass along with the payload.
#[derive(Debug, Clone, Default)]
pub struct PublishMeta {
    pub message_type: Option<String>,
    /// Reuse the correlation id of the envelope being answered.
    pub correlation_id: Option<String>,
}

impl PublishMeta {
    pub fn typed(message_type: impl Into<String>) -> Self {
        Self {
            message_type: Some(message_type.into()),
            correlation_id: None,
        }
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: Value, meta: PublishMeta) -> Self {
        Self {
            topic: topic.into(),
            payload,
            meta: EnvelopeMeta {
                message_type: meta
                    .message_type
                    .unwrap_or_else(|| DEFAULT_MESSAGE_TYPE.to_string()),
                timestamp: Utc::now(),
                correlation_id: meta
                    .correlation_id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn defaults_fill_missing_meta() {
        let a = Envelope::new("nachos.llm.proxy.request", json!({}), PublishMeta::default());
        let b = Envelope::new("nachos.llm.proxy.request", json!({}), PublishMeta::default());
        assert_eq!(a.meta.message_type, DEFAULT_MESSAGE_TYPE);
        assert_ne!(a.meta.correlation_id, b.meta.correlation_id);
    }

    #[test]
    fn wire_shape_uses_type_and_camel_case() {
        let env = Envelope::new(
            "nachos.tool.browser.request",
            json!({"url": "https://example.com"}),
            PublishMeta::typed("tool.request").correlated("abc"),
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["meta"]["type"], "tool.request");
        assert_eq!(value["meta"]["correlationId"], "abc");
        assert!(value["meta"]["timestamp"].is_string());
        let back: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, env);
    }
}
