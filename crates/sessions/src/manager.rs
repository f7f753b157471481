use std::sync::Arc;

use {
    chrono::Utc,
    serde_json::{Map, Value},
    tracing::{debug, info},
};

use crate::{
    error::SessionError,
    store::StateStore,
    types::{Message, NewMessage, NewSession, Session, SessionFilter, SessionStatus},
};

/// Session lifecycle on top of a [`StateStore`].
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn StateStore>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub async fn get_or_create_session(
        &self,
        channel: &str,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Session, SessionError> {
        self.get_or_create(NewSession::new(channel, conversation_id, user_id))
            .await
    }

    /// Return the active session for the conversation, reactivate an inactive
    /// one, or create a new one.
    pub async fn get_or_create(&self, new: NewSession) -> Result<Session, SessionError> {
        if let Some(existing) = self
            .store
            .find_session(&new.channel, &new.conversation_id)
            .await?
        {
            if existing.is_active() {
                return Ok(existing);
            }
            let id = existing.id.clone();
            return match self.transition(existing, SessionStatus::Active).await {
                Err(SessionError::Conflict(_)) => self.winner(&new, &id).await,
                other => other,
            };
        }

        let now = Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            channel: new.channel.clone(),
            conversation_id: new.conversation_id.clone(),
            user_id: new.user_id.clone(),
            status: SessionStatus::Active,
            system_prompt: new.system_prompt.clone(),
            config: new.config.clone().unwrap_or_else(empty_object),
            metadata: new.metadata.clone().unwrap_or_else(empty_object),
            created_at: now,
            updated_at: now,
        };
        match self.store.insert_session(&session).await {
            Ok(()) => {
                info!(
                    session_id = %session.id,
                    channel = %session.channel,
                    conversation_id = %session.conversation_id,
                    "session created"
                );
                Ok(session)
            },
            Err(SessionError::Conflict(_)) => self.winner(&new, &session.id).await,
            Err(e) => Err(e),
        }
    }

    /// Another caller created or reactivated a session for the same
    /// conversation first. Use theirs.
    async fn winner(&self, new: &NewSession, attempted: &str) -> Result<Session, SessionError> {
        debug!(attempted, "concurrent session creation, using existing active session");
        self.store
            .find_session(&new.channel, &new.conversation_id)
            .await?
            .filter(Session::is_active)
            .ok_or_else(|| SessionError::Conflict(attempted.to_string()))
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, SessionError> {
        self.store.get_session(id).await
    }

    pub async fn find_session(
        &self,
        channel: &str,
        conversation_id: &str,
    ) -> Result<Option<Session>, SessionError> {
        self.store.find_session(channel, conversation_id).await
    }

    async fn require(&self, id: &str) -> Result<Session, SessionError> {
        self.store
            .get_session(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Append to an active session. `None` when the session is missing or not
    /// active; nothing is written in that case.
    pub async fn add_message(
        &self,
        session_id: &str,
        message: NewMessage,
    ) -> Result<Option<Message>, SessionError> {
        match self.store.get_session(session_id).await? {
            Some(s) if s.is_active() => {},
            Some(s) => {
                debug!(session_id, status = %s.status, "not adding message to inactive session");
                return Ok(None);
            },
            None => {
                debug!(session_id, "not adding message to unknown session");
                return Ok(None);
            },
        }

        let now = Utc::now();
        let message = message.into_message(session_id, now);
        self.store.insert_message(&message).await?;
        self.store.touch(session_id, now).await?;
        Ok(Some(message))
    }

    /// Replace the full history, typically after compaction. Either every
    /// message is replaced or the previous history stays as it was.
    pub async fn replace_messages(
        &self,
        session_id: &str,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<Message>, SessionError> {
        self.require(session_id).await?;
        let now = Utc::now();
        let messages: Vec<Message> = messages
            .into_iter()
            .map(|m| m.into_message(session_id, now))
            .collect();
        self.store.replace_messages(session_id, &messages).await?;
        self.store.touch(session_id, now).await?;
        Ok(messages)
    }

    pub async fn get_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, SessionError> {
        self.store.get_messages(session_id, limit).await
    }

    pub async fn message_count(&self, session_id: &str) -> Result<u64, SessionError> {
        self.store.message_count(session_id).await
    }

    // ── Status ──────────────────────────────────────────────────────────────

    pub async fn update_status(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> Result<Session, SessionError> {
        let session = self.require(id).await?;
        self.transition(session, status).await
    }

    async fn transition(
        &self,
        mut session: Session,
        status: SessionStatus,
    ) -> Result<Session, SessionError> {
        if !session.status.can_transition_to(status) {
            return Err(SessionError::InvalidTransition {
                from: session.status,
                to: status,
            });
        }
        if session.status == status {
            return Ok(session);
        }
        let from = session.status;
        session.status = status;
        session.updated_at = Utc::now();
        self.store.update_session(&session).await?;
        info!(session_id = %session.id, %from, to = %status, "session status changed");
        Ok(session)
    }

    pub async fn pause(&self, id: &str) -> Result<Session, SessionError> {
        self.update_status(id, SessionStatus::Paused).await
    }

    pub async fn end(&self, id: &str) -> Result<Session, SessionError> {
        self.update_status(id, SessionStatus::Ended).await
    }

    pub async fn reactivate(&self, id: &str) -> Result<Session, SessionError> {
        self.update_status(id, SessionStatus::Active).await
    }

    // ── Config, metadata, prompt ────────────────────────────────────────────

    /// Shallow-merge `patch` into the session config. `null` values remove keys.
    pub async fn update_config(&self, id: &str, patch: Value) -> Result<Session, SessionError> {
        let mut session = self.require(id).await?;
        merge_shallow(&mut session.config, patch);
        session.updated_at = Utc::now();
        self.store.update_session(&session).await?;
        Ok(session)
    }

    /// Shallow-merge `patch` into the session metadata. `null` values remove keys.
    pub async fn update_metadata(&self, id: &str, patch: Value) -> Result<Session, SessionError> {
        let mut session = self.require(id).await?;
        merge_shallow(&mut session.metadata, patch);
        session.updated_at = Utc::now();
        self.store.update_session(&session).await?;
        Ok(session)
    }

    pub async fn set_system_prompt(
        &self,
        id: &str,
        prompt: Option<String>,
    ) -> Result<Session, SessionError> {
        let mut session = self.require(id).await?;
        session.system_prompt = prompt;
        session.updated_at = Utc::now();
        self.store.update_session(&session).await?;
        Ok(session)
    }

    pub async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>, SessionError> {
        self.store.list_sessions(filter).await
    }

    pub async fn delete_session(&self, id: &str) -> Result<bool, SessionError> {
        let removed = self.store.delete_session(id).await?;
        if removed {
            info!(session_id = id, "session deleted");
        }
        Ok(removed)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn merge_shallow(target: &mut Value, patch: Value) {
    let Value::Object(patch) = patch else {
        return;
    };
    if !target.is_object() {
        *target = empty_object();
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(&key);
            } else {
                map.insert(key, value);
            }
        }
    }
}
