use crate::types::SessionStatus;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {id} is {status}")]
    Inactive { id: String, status: SessionStatus },
    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
    /// A uniqueness constraint rejected the write.
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("state store error: {0}")]
    Store(#[source] sqlx::Error),
    #[error("corrupt session data: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for SessionError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_string())
            },
            _ => Self::Store(e),
        }
    }
}
