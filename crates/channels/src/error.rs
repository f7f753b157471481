#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0:?} is not registered")]
    NotRegistered(String),

    #[error("channel {0:?} is already registered")]
    Duplicate(String),

    #[error("channel {channel}: {message}")]
    Adapter { channel: String, message: String },

    #[error("invalid channel payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

impl ChannelError {
    pub fn adapter(channel: impl Into<String>, message: impl ToString) -> Self {
        Self::Adapter {
            channel: channel.into(),
            message: message.to_string(),
        }
    }
}
