use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

use crate::{
    error::ChannelError,
    message::{OutboundMessage, SendResult},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHealth {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ChannelHealth {
    pub fn ok() -> Self {
        Self {
            healthy: true,
            details: None,
        }
    }

    pub fn unhealthy(details: impl Into<String>) -> Self {
        Self {
            healthy: false,
            details: Some(details.into()),
        }
    }
}

/// A messaging platform connection.
///
/// Adapters are shared behind `Arc`, so lifecycle methods take `&self` and
/// keep their own interior state.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel identifier used in topics (e.g. "slack").
    fn id(&self) -> &str;

    fn name(&self) -> &str {
        self.id()
    }

    async fn initialize(&self, config: &Value) -> Result<(), ChannelError>;

    async fn start(&self) -> Result<(), ChannelError>;

    async fn stop(&self) -> Result<(), ChannelError>;

    /// Delivery failures are reported in the result, not as an error.
    async fn send_message(&self, message: &OutboundMessage) -> SendResult;

    async fn health_check(&self) -> ChannelHealth;
}
