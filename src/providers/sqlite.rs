use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::time::Duration;

use super::{Lease, MessageBody, NewMessage, ProviderError, QueueMessage, QueueScope, WorkQueue};

/// SQLite-backed [`WorkQueue`].
///
/// One `work_queue` row per run id. A leased row has `leased = 1`; its
/// `locked_until` deadline is NULL when heartbeats were cancelled.
pub struct SqliteWorkQueue {
    pool: SqlitePool,
}

const SELECT_COLUMNS: &str =
    "id, scope, queue, body, priority_ms, concurrency_key, available_at, leased, locked_until, delivery_count, enqueued_at";

impl SqliteWorkQueue {
    /// Open (or create) a queue database.
    ///
    /// `database_url` is a sqlx SQLite URL, e.g. `sqlite:queue.db?mode=rwc`.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let mut options = SqlitePoolOptions::new();
        if is_memory {
            // A private in-memory database lives as long as its only connection.
            options = options.max_connections(1).idle_timeout(None).max_lifetime(None);
        } else {
            options = options.max_connections(5);
        }
        let pool = options
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:").await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS work_queue (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                queue TEXT NOT NULL,
                body TEXT NOT NULL,
                priority_ms INTEGER NOT NULL DEFAULT 0,
                concurrency_key TEXT,
                available_at INTEGER NOT NULL,
                leased INTEGER NOT NULL DEFAULT 0,
                locked_until INTEGER,
                delivery_count INTEGER NOT NULL DEFAULT 0,
                enqueued_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_work_queue_scope ON work_queue (scope, available_at)")
            .execute(pool)
            .await?;
        Ok(())
    }

    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
        }
        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }
        if error_msg.contains("connection") || error_msg.contains("timeout") {
            return ProviderError::retryable(operation, format!("Connection error: {error_msg}"));
        }
        ProviderError::retryable(operation, error_msg)
    }

    fn millis_after(d: Duration) -> i64 {
        let ms = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
        Utc::now().timestamp_millis().saturating_add(ms)
    }

    fn scope_from_key(key: &str) -> Result<QueueScope, ProviderError> {
        match key.strip_prefix("env:") {
            Some(id) => Ok(QueueScope::environment(id)),
            None if key == "shared" => Ok(QueueScope::Shared),
            None => Err(ProviderError::permanent("decode_scope", format!("unknown scope {key}"))),
        }
    }

    fn timestamp(operation: &str, ms: i64) -> Result<DateTime<Utc>, ProviderError> {
        DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| ProviderError::permanent(operation, format!("timestamp out of range: {ms}")))
    }

    fn row_to_message(operation: &str, row: &SqliteRow) -> Result<QueueMessage, ProviderError> {
        let get_err = |col: &str, e: sqlx::Error| ProviderError::permanent(operation, format!("Failed to get {col}: {e}"));
        let scope: String = row.try_get("scope").map_err(|e| get_err("scope", e))?;
        let leased: i64 = row.try_get("leased").map_err(|e| get_err("leased", e))?;
        let locked_until: Option<i64> = row.try_get("locked_until").map_err(|e| get_err("locked_until", e))?;
        let lease = match (leased != 0, locked_until) {
            (false, _) => None,
            (true, Some(ms)) => Some(Lease::Until(Self::timestamp(operation, ms)?)),
            (true, None) => Some(Lease::Parked),
        };
        let delivery_count: i64 = row.try_get("delivery_count").map_err(|e| get_err("delivery_count", e))?;
        Ok(QueueMessage {
            id: row.try_get("id").map_err(|e| get_err("id", e))?,
            scope: Self::scope_from_key(&scope)?,
            queue: row.try_get("queue").map_err(|e| get_err("queue", e))?,
            body: row.try_get("body").map_err(|e| get_err("body", e))?,
            priority_ms: row.try_get("priority_ms").map_err(|e| get_err("priority_ms", e))?,
            concurrency_key: row.try_get("concurrency_key").map_err(|e| get_err("concurrency_key", e))?,
            available_at: Self::timestamp(
                operation,
                row.try_get("available_at").map_err(|e| get_err("available_at", e))?,
            )?,
            lease,
            delivery_count: delivery_count.max(0) as u32,
            enqueued_at: Self::timestamp(
                operation,
                row.try_get("enqueued_at").map_err(|e| get_err("enqueued_at", e))?,
            )?,
        })
    }
}

#[async_trait]
impl WorkQueue for SqliteWorkQueue {
    async fn enqueue(&self, message: NewMessage) -> Result<(), ProviderError> {
        let now = Utc::now().timestamp_millis();
        let body = message.body.encode()?;
        let available_at = message.available_at.map(|t| t.timestamp_millis()).unwrap_or(now);
        sqlx::query(
            r#"
            INSERT INTO work_queue (id, scope, queue, body, priority_ms, concurrency_key, available_at, leased, locked_until, delivery_count, enqueued_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL, 0, ?8)
            ON CONFLICT(id) DO UPDATE SET
                scope = excluded.scope,
                queue = excluded.queue,
                body = excluded.body,
                priority_ms = excluded.priority_ms,
                concurrency_key = excluded.concurrency_key,
                available_at = excluded.available_at,
                leased = 0,
                locked_until = NULL,
                enqueued_at = excluded.enqueued_at
            "#,
        )
        .bind(&message.id)
        .bind(message.scope.key())
        .bind(&message.queue)
        .bind(body)
        .bind(message.priority_ms)
        .bind(&message.concurrency_key)
        .bind(available_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("enqueue", e))?;

        tracing::debug!(target: "courier::providers::sqlite", message_id = %message.id, "Enqueued message");
        Ok(())
    }

    async fn dequeue(
        &self,
        scope: &QueueScope,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, ProviderError> {
        let now_ms = Utc::now().timestamp_millis();
        let locked_until = Self::millis_after(visibility_timeout);
        // Single statement so concurrent connections cannot lease the same row.
        let sql = format!(
            r#"
            UPDATE work_queue
            SET leased = 1, locked_until = ?3, delivery_count = delivery_count + 1
            WHERE id = (
                SELECT id FROM work_queue
                WHERE scope = ?1
                  AND ((leased = 0 AND available_at <= ?2)
                       OR (leased = 1 AND locked_until IS NOT NULL AND locked_until <= ?2))
                ORDER BY (available_at - priority_ms) ASC, enqueued_at ASC
                LIMIT 1
            )
            RETURNING {SELECT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(scope.key())
            .bind(now_ms)
            .bind(locked_until)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("dequeue", e))?;

        match row {
            Some(row) => {
                let message = Self::row_to_message("dequeue", &row)?;
                tracing::debug!(
                    target: "courier::providers::sqlite",
                    message_id = %message.id,
                    delivery_count = message.delivery_count,
                    "Leased message"
                );
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    async fn acknowledge(&self, message_id: &str) -> Result<bool, ProviderError> {
        let result = sqlx::query("DELETE FROM work_queue WHERE id = ?1")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("acknowledge", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn nack(&self, message_id: &str, not_before: Option<DateTime<Utc>>) -> Result<bool, ProviderError> {
        let available_at = not_before.unwrap_or_else(Utc::now).timestamp_millis();
        let result =
            sqlx::query("UPDATE work_queue SET leased = 0, locked_until = NULL, available_at = ?2 WHERE id = ?1")
                .bind(message_id)
                .bind(available_at)
                .execute(&self.pool)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("nack", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat(&self, message_id: &str, extension: Duration) -> Result<bool, ProviderError> {
        let result = sqlx::query("UPDATE work_queue SET locked_until = ?2 WHERE id = ?1 AND leased = 1")
            .bind(message_id)
            .bind(Self::millis_after(extension))
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("heartbeat", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel_heartbeat(&self, message_id: &str) -> Result<bool, ProviderError> {
        let result = sqlx::query("UPDATE work_queue SET leased = 1, locked_until = NULL \
             WHERE id = ?1 AND json_extract(body, '$.type') IS NOT 'RESUME'")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("cancel_heartbeat", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn replace(
        &self,
        message_id: &str,
        body: MessageBody,
        available_at: Option<DateTime<Utc>>,
    ) -> Result<bool, ProviderError> {
        let encoded = body.encode()?;
        let result = match available_at {
            Some(at) => sqlx::query(
                "UPDATE work_queue SET body = ?2, leased = 0, locked_until = NULL, available_at = ?3 WHERE id = ?1",
            )
            .bind(message_id)
            .bind(encoded)
            .bind(at.timestamp_millis())
            .execute(&self.pool)
            .await,
            None => sqlx::query("UPDATE work_queue SET body = ?2 WHERE id = ?1")
                .bind(message_id)
                .bind(encoded)
                .execute(&self.pool)
                .await,
        }
        .map_err(|e| Self::sqlx_to_provider_error("replace", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn peek(&self, message_id: &str) -> Result<Option<QueueMessage>, ProviderError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM work_queue WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("peek", e))?;
        row.map(|r| Self::row_to_message("peek", &r)).transpose()
    }
}
