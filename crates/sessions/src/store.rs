use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
};

use crate::{
    error::SessionError,
    types::{Message, Session, SessionFilter},
};

/// Durable persistence for sessions and their messages.
///
/// Implementations provide atomicity for single calls (notably
/// `replace_messages`) but no coordination between calls.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create tables and indexes. Idempotent.
    async fn init(&self) -> Result<(), SessionError>;

    /// Fails with [`SessionError::Conflict`] when another active session
    /// already owns the same conversation.
    async fn insert_session(&self, session: &Session) -> Result<(), SessionError>;

    async fn get_session(&self, id: &str) -> Result<Option<Session>, SessionError>;

    /// The active session for the conversation if there is one, otherwise the
    /// most recently updated inactive one.
    async fn find_session(
        &self,
        channel: &str,
        conversation_id: &str,
    ) -> Result<Option<Session>, SessionError>;

    /// Persist status, prompt, config, metadata and `updated_at`.
    async fn update_session(&self, session: &Session) -> Result<(), SessionError>;

    /// Set only `updated_at`, leaving every other column as stored.
    async fn touch(&self, id: &str, updated_at: DateTime<Utc>) -> Result<(), SessionError>;

    /// Returns whether a session was removed. Its messages go with it.
    async fn delete_session(&self, id: &str) -> Result<bool, SessionError>;

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>, SessionError>;

    async fn insert_message(&self, message: &Message) -> Result<(), SessionError>;

    /// Messages in insertion order. With a limit, the most recent `limit`.
    async fn get_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, SessionError>;

    async fn message_count(&self, session_id: &str) -> Result<u64, SessionError>;

    /// Swap the whole history in one transaction.
    async fn replace_messages(
        &self,
        session_id: &str,
        messages: &[Message],
    ) -> Result<(), SessionError>;

    async fn health(&self) -> Result<(), SessionError>;

    async fn close(&self);
}
