#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Invalid provider configuration. Raised before anything is instantiated.
    #[error("audit configuration error: {0}")]
    Configuration(String),
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("audit database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("audit webhook error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("audit provider {provider} failed: {message}")]
    Provider { provider: String, message: String },
    #[error("audit provider {0} does not support queries")]
    QueryUnsupported(String),
}

impl AuditError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
