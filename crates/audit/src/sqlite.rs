use std::{path::PathBuf, str::FromStr};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    sqlx::{
        QueryBuilder, Sqlite, SqlitePool,
        sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    },
    tracing::warn,
};

use crate::{
    buffer::EventBuffer,
    error::AuditError,
    event::{AuditEvent, AuditOutcome, AuditQuery},
    provider::AuditProvider,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteAuditConfig {
    /// Database file, or `:memory:`.
    pub path: PathBuf,
    pub batch_size: usize,
}

impl Default for SqliteAuditConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("audit.db"),
            batch_size: 100,
        }
    }
}

/// Embedded-database audit store with native querying.
pub struct SqliteAuditProvider {
    pool: SqlitePool,
    buffer: EventBuffer,
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: String,
    timestamp: String,
    instance_id: String,
    user_id: Option<String>,
    session_id: Option<String>,
    channel: Option<String>,
    event_type: String,
    action: String,
    outcome: String,
    security_mode: String,
    extra: Option<String>,
}

impl TryFrom<AuditRow> for AuditEvent {
    type Error = AuditError;

    fn try_from(r: AuditRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str| AuditError::Provider {
            provider: "sqlite".into(),
            message: format!("corrupt {what} in row {}", r.id),
        };
        let timestamp = DateTime::parse_from_rfc3339(&r.timestamp)
            .map_err(|_| corrupt("timestamp"))?
            .with_timezone(&Utc);
        let outcome = AuditOutcome::parse(&r.outcome).ok_or_else(|| corrupt("outcome"))?;
        let security_mode = r.security_mode.parse().map_err(|_| corrupt("security mode"))?;
        let extra = match r.extra.as_deref() {
            Some(raw) => serde_json::from_str(raw)?,
            None => Default::default(),
        };
        Ok(Self {
            id: r.id,
            timestamp,
            instance_id: r.instance_id,
            user_id: r.user_id,
            session_id: r.session_id,
            channel: r.channel,
            event_type: r.event_type,
            action: r.action,
            outcome,
            security_mode,
            extra,
        })
    }
}

impl SqliteAuditProvider {
    pub async fn connect(config: &SqliteAuditConfig) -> Result<Self, AuditError> {
        let pool = if config.path.as_os_str() == ":memory:" {
            // One long-lived connection, otherwise each connection sees its own database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
                .await?
        } else {
            let options = SqliteConnectOptions::new()
                .filename(&config.path)
                .create_if_missing(true);
            SqlitePoolOptions::new().connect_with(options).await?
        };
        Ok(Self::with_pool(pool, config.batch_size))
    }

    pub fn with_pool(pool: SqlitePool, batch_size: usize) -> Self {
        Self {
            pool,
            buffer: EventBuffer::new(batch_size),
        }
    }

    async fn insert_batch(&self, batch: &[AuditEvent]) -> Result<(), AuditError> {
        let mut tx = self.pool.begin().await?;
        for e in batch {
            let extra = if e.extra.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&e.extra)?)
            };
            sqlx::query(
                r#"INSERT OR IGNORE INTO audit_events
                   (id, timestamp, timestamp_ms, instance_id, user_id, session_id, channel,
                    event_type, action, outcome, security_mode, extra)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&e.id)
            .bind(e.timestamp.to_rfc3339())
            .bind(e.timestamp.timestamp_millis())
            .bind(&e.instance_id)
            .bind(&e.user_id)
            .bind(&e.session_id)
            .bind(&e.channel)
            .bind(&e.event_type)
            .bind(&e.action)
            .bind(e.outcome.as_str())
            .bind(e.security_mode.as_str())
            .bind(extra)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditProvider for SqliteAuditProvider {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn init(&self) -> Result<(), AuditError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS audit_events (
                id            TEXT    PRIMARY KEY,
                timestamp     TEXT    NOT NULL,
                timestamp_ms  INTEGER NOT NULL,
                instance_id   TEXT    NOT NULL,
                user_id       TEXT,
                session_id    TEXT,
                channel       TEXT,
                event_type    TEXT    NOT NULL,
                action        TEXT    NOT NULL,
                outcome       TEXT    NOT NULL,
                security_mode TEXT    NOT NULL,
                extra         TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_events_ts ON audit_events(timestamp_ms)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log(&self, event: AuditEvent) -> Result<(), AuditError> {
        if self.buffer.push(event).await {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), AuditError> {
        let batch = self.buffer.take().await;
        if batch.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.insert_batch(&batch).await {
            warn!(count = batch.len(), error = %e, "audit insert failed, requeueing batch");
            self.buffer.requeue(batch).await;
            return Err(e);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AuditError> {
        let flushed = self.flush().await;
        self.pool.close().await;
        flushed
    }

    fn supports_query(&self) -> bool {
        true
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, AuditError> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT id, timestamp, instance_id, user_id, session_id, channel, event_type, \
             action, outcome, security_mode, extra FROM audit_events WHERE 1 = 1",
        );
        if let Some(from) = query.from {
            qb.push(" AND timestamp_ms >= ").push_bind(from.timestamp_millis());
        }
        if let Some(to) = query.to {
            qb.push(" AND timestamp_ms <= ").push_bind(to.timestamp_millis());
        }
        if let Some(user) = &query.user_id {
            qb.push(" AND user_id = ").push_bind(user.clone());
        }
        if let Some(session) = &query.session_id {
            qb.push(" AND session_id = ").push_bind(session.clone());
        }
        if let Some(event_type) = &query.event_type {
            qb.push(" AND event_type = ").push_bind(event_type.clone());
        }
        if let Some(outcome) = query.outcome {
            qb.push(" AND outcome = ").push_bind(outcome.as_str());
        }
        qb.push(" ORDER BY timestamp_ms ASC, rowid ASC LIMIT ")
            .push_bind(query.limit.map_or(-1, |l| l as i64))
            .push(" OFFSET ")
            .push_bind(query.offset as i64);

        let rows = qb.build_query_as::<AuditRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(AuditEvent::try_from).collect()
    }
}
