use std::str::FromStr;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    serde_json::Value,
    sqlx::{
        QueryBuilder, Sqlite, SqlitePool,
        sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    },
    tracing::debug,
};

use crate::{
    error::SessionError,
    store::StateStore,
    types::{Message, MessageRole, Session, SessionFilter, SessionStatus},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// SQLite file, or `:memory:`.
    pub db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: "nachos.db".into(),
        }
    }
}

// ── Rows ────────────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    channel: String,
    conversation_id: String,
    user_id: String,
    status: String,
    system_prompt: Option<String>,
    config: String,
    metadata: String,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<SessionRow> for Session {
    type Error = SessionError;

    fn try_from(r: SessionRow) -> Result<Self, Self::Error> {
        let status = SessionStatus::from_str(&r.status)
            .map_err(|e| SessionError::Store(sqlx::Error::Decode(e.into())))?;
        Ok(Self {
            id: r.id,
            channel: r.channel,
            conversation_id: r.conversation_id,
            user_id: r.user_id,
            status,
            system_prompt: r.system_prompt,
            config: serde_json::from_str(&r.config)?,
            metadata: serde_json::from_str(&r.metadata)?,
            created_at: from_ms(r.created_at),
            updated_at: from_ms(r.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    session_id: String,
    role: String,
    content: String,
    tool_calls: Option<String>,
    created_at: i64,
}

impl TryFrom<MessageRow> for Message {
    type Error = SessionError;

    fn try_from(r: MessageRow) -> Result<Self, Self::Error> {
        let role = MessageRole::from_str(&r.role)
            .map_err(|e| SessionError::Store(sqlx::Error::Decode(e.into())))?;
        let tool_calls = r.tool_calls.as_deref().map(serde_json::from_str).transpose()?;
        Ok(Self {
            id: r.id,
            session_id: r.session_id,
            role,
            content: r.content,
            tool_calls,
            created_at: from_ms(r.created_at),
        })
    }
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn to_json(value: &Value) -> Result<String, SessionError> {
    Ok(serde_json::to_string(value)?)
}

const SESSION_COLUMNS: &str = "id, channel, conversation_id, user_id, status, system_prompt, \
                               config, metadata, created_at, updated_at";

// ── Store ───────────────────────────────────────────────────────────────────

/// SQLite-backed [`StateStore`].
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the configured database and create tables.
    pub async fn connect(config: &StateConfig) -> Result<Self, SessionError> {
        let pool = if config.db_path == ":memory:" {
            // A single connection that never recycles, so the database lives
            // as long as the pool.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true))
                .await?
        } else {
            let options = SqliteConnectOptions::new()
                .filename(&config.db_path)
                .create_if_missing(true)
                .foreign_keys(true);
            SqlitePoolOptions::new().connect_with(options).await?
        };
        let store = Self::new(pool);
        store.init().await?;
        debug!(db_path = %config.db_path, "state store ready");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, SessionError> {
        Self::connect(&StateConfig {
            db_path: ":memory:".into(),
        })
        .await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn init(&self) -> Result<(), SessionError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS sessions (
                id              TEXT PRIMARY KEY,
                channel         TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                user_id         TEXT NOT NULL,
                status          TEXT NOT NULL,
                system_prompt   TEXT,
                config          TEXT NOT NULL DEFAULT '{}',
                metadata        TEXT NOT NULL DEFAULT '{}',
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        // At most one active session per conversation.
        sqlx::query(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_active_conversation
               ON sessions(channel, conversation_id) WHERE status = 'active'"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS messages (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                id          TEXT NOT NULL UNIQUE,
                session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                role        TEXT NOT NULL,
                content     TEXT NOT NULL,
                tool_calls  TEXT,
                created_at  INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, seq)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_session(&self, s: &Session) -> Result<(), SessionError> {
        sqlx::query(
            r#"INSERT INTO sessions (id, channel, conversation_id, user_id, status,
                                     system_prompt, config, metadata, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&s.id)
        .bind(&s.channel)
        .bind(&s.conversation_id)
        .bind(&s.user_id)
        .bind(s.status.as_str())
        .bind(&s.system_prompt)
        .bind(to_json(&s.config)?)
        .bind(to_json(&s.metadata)?)
        .bind(s.created_at.timestamp_millis())
        .bind(s.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, SessionError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?");
        sqlx::query_as::<_, SessionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Session::try_from)
            .transpose()
    }

    async fn find_session(
        &self,
        channel: &str,
        conversation_id: &str,
    ) -> Result<Option<Session>, SessionError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE channel = ? AND conversation_id = ? \
             ORDER BY (status = 'active') DESC, updated_at DESC LIMIT 1"
        );
        sqlx::query_as::<_, SessionRow>(&sql)
            .bind(channel)
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Session::try_from)
            .transpose()
    }

    async fn update_session(&self, s: &Session) -> Result<(), SessionError> {
        let result = sqlx::query(
            r#"UPDATE sessions
               SET status = ?, system_prompt = ?, config = ?, metadata = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(s.status.as_str())
        .bind(&s.system_prompt)
        .bind(to_json(&s.config)?)
        .bind(to_json(&s.metadata)?)
        .bind(s.updated_at.timestamp_millis())
        .bind(&s.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(SessionError::NotFound(s.id.clone()));
        }
        Ok(())
    }

    async fn touch(&self, id: &str, updated_at: DateTime<Utc>) -> Result<(), SessionError> {
        let result = sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(updated_at.timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SessionError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<bool, SessionError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>, SessionError> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE 1 = 1"));
        if let Some(channel) = &filter.channel {
            qb.push(" AND channel = ").push_bind(channel.clone());
        }
        if let Some(user) = &filter.user_id {
            qb.push(" AND user_id = ").push_bind(user.clone());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY updated_at DESC, id ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        qb.build_query_as::<SessionRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Session::try_from)
            .collect()
    }

    async fn insert_message(&self, m: &Message) -> Result<(), SessionError> {
        insert_message(&self.pool, m).await
    }

    async fn get_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, SessionError> {
        let rows = match limit {
            Some(limit) => {
                sqlx::query_as::<_, MessageRow>(
                    r#"SELECT id, session_id, role, content, tool_calls, created_at FROM (
                           SELECT * FROM messages WHERE session_id = ? ORDER BY seq DESC LIMIT ?
                       ) ORDER BY seq ASC"#,
                )
                .bind(session_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            },
            None => {
                sqlx::query_as::<_, MessageRow>(
                    "SELECT id, session_id, role, content, tool_calls, created_at \
                     FROM messages WHERE session_id = ? ORDER BY seq ASC",
                )
                .bind(session_id)
                .fetch_all(&self.pool)
                .await?
            },
        };
        rows.into_iter().map(Message::try_from).collect()
    }

    async fn message_count(&self, session_id: &str) -> Result<u64, SessionError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn replace_messages(
        &self,
        session_id: &str,
        messages: &[Message],
    ) -> Result<(), SessionError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        for m in messages {
            insert_message(&mut *tx, m).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn health(&self) -> Result<(), SessionError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

async fn insert_message<'e, E>(executor: E, m: &Message) -> Result<(), SessionError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let tool_calls = m.tool_calls.as_ref().map(to_json).transpose()?;
    sqlx::query(
        r#"INSERT INTO messages (id, session_id, role, content, tool_calls, created_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&m.id)
    .bind(&m.session_id)
    .bind(m.role.as_str())
    .bind(&m.content)
    .bind(tool_calls)
    .bind(m.created_at.timestamp_millis())
    .execute(executor)
    .await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, serde_json::json};

    fn session(id: &str, conversation: &str, status: SessionStatus) -> Session {
        let now = Utc::now();
        Session {
            id: id.into(),
            channel: "slack".into(),
            conversation_id: conversation.into(),
            user_id: "u1".into(),
            status,
            system_prompt: None,
            config: json!({}),
            metadata: json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    fn message(id: &str, session_id: &str, content: &str) -> Message {
        Message {
            id: id.into(),
            session_id: session_id.into(),
            role: MessageRole::User,
            content: content.into(),
            tool_calls: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_active_session_for_conversation_conflicts() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        store
            .insert_session(&session("a", "c1", SessionStatus::Active))
            .await
            .unwrap();
        let err = store
            .insert_session(&session("b", "c1", SessionStatus::Active))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Conflict(_)));

        // Inactive duplicates are fine.
        store
            .insert_session(&session("c", "c1", SessionStatus::Ended))
            .await
            .unwrap();
        let found = store.find_session("slack", "c1").await.unwrap().unwrap();
        assert_eq!(found.id, "a");
    }

    #[tokio::test]
    async fn touch_only_moves_updated_at() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let mut s = session("a", "c1", SessionStatus::Active);
        store.insert_session(&s).await.unwrap();
        s.status = SessionStatus::Paused;
        s.metadata = json!({ "k": 1 });
        store.update_session(&s).await.unwrap();

        let later = s.updated_at + chrono::Duration::seconds(5);
        store.touch("a", later).await.unwrap();
        let stored = store.get_session("a").await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Paused);
        assert_eq!(stored.metadata, json!({ "k": 1 }));
        assert_eq!(stored.updated_at.timestamp_millis(), later.timestamp_millis());

        assert!(matches!(
            store.touch("missing", later).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn deleting_session_cascades_messages() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        store
            .insert_session(&session("a", "c1", SessionStatus::Active))
            .await
            .unwrap();
        store.insert_message(&message("m1", "a", "hi")).await.unwrap();
        assert_eq!(store.message_count("a").await.unwrap(), 1);

        assert!(store.delete_session("a").await.unwrap());
        assert_eq!(store.message_count("a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn limited_messages_are_the_latest_in_order() {
        let store = SqliteStateStore::in_memory().await.unwrap();
        store
            .insert_session(&session("a", "c1", SessionStatus::Active))
            .await
            .unwrap();
        for i in 0..5 {
            store
                .insert_message(&message(&format!("m{i}"), "a", &i.to_string()))
                .await
                .unwrap();
        }
        let last: Vec<_> = store
            .get_messages("a", Some(2))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(last, vec!["3", "4"]);
    }

    #[tokio::test]
    async fn file_database_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let config = StateConfig {
            db_path: dir.path().join("state.db").display().to_string(),
        };
        {
            let store = SqliteStateStore::connect(&config).await.unwrap();
            store
                .insert_session(&session("a", "c1", SessionStatus::Active))
                .await
                .unwrap();
            store.close().await;
        }
        let store = SqliteStateStore::connect(&config).await.unwrap();
        assert!(store.get_session("a").await.unwrap().is_some());
        store.health().await.unwrap();
    }
}
