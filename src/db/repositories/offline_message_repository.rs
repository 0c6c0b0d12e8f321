use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::models::{ExecutionMode, OfflineMessage, OfflineStatus};
use crate::services::offline_message_store::OfflineMessageStore;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS offline_messages (
        terminal_id TEXT NOT NULL,
        message_id INTEGER NOT NULL,
        organization_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        payload JSONB NOT NULL,
        execution_mode TEXT NOT NULL,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retry_count INTEGER NOT NULL,
        issued_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        failure_reason TEXT,
        PRIMARY KEY (terminal_id, message_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_offline_messages_pending
        ON offline_messages (terminal_id, issued_at, message_id)
        WHERE status = 'PENDING'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_offline_messages_expires_at
        ON offline_messages (expires_at)
    "#,
];

#[derive(Debug, sqlx::FromRow)]
struct OfflineMessageRow {
    terminal_id: String,
    message_id: i32,
    organization_id: String,
    kind: String,
    payload: JsonValue,
    execution_mode: String,
    status: String,
    retry_count: i32,
    max_retry_count: i32,
    issued_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    failure_reason: Option<String>,
}

impl TryFrom<OfflineMessageRow> for OfflineMessage {
    type Error = AppError;

    fn try_from(row: OfflineMessageRow) -> Result<Self, Self::Error> {
        let execution_mode = ExecutionMode::parse(&row.execution_mode).ok_or_else(|| {
            AppError::Database(format!("unknown execution_mode '{}'", row.execution_mode))
        })?;
        let status = OfflineStatus::parse(&row.status)
            .ok_or_else(|| AppError::Database(format!("unknown status '{}'", row.status)))?;

        Ok(OfflineMessage {
            message_id: row.message_id,
            terminal_id: row.terminal_id,
            organization_id: row.organization_id,
            kind: row.kind,
            payload: row.payload,
            execution_mode,
            status,
            retry_count: row.retry_count,
            max_retry_count: row.max_retry_count,
            issued_at: row.issued_at,
            created_at: row.created_at,
            expires_at: row.expires_at,
            failure_reason: row.failure_reason,
        })
    }
}

/// PostgreSQL-backed offline message store.
pub struct PgOfflineMessageStore {
    db_pool: Arc<PgPool>,
}

impl PgOfflineMessageStore {
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self { db_pool }
    }

    /// Create the table and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> AppResult<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&*self.db_pool).await?;
        }
        Ok(())
    }

    async fn settle(
        &self,
        terminal_id: &str,
        message_id: i32,
        status: OfflineStatus,
        reason: Option<&str>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE offline_messages
            SET status = $3, failure_reason = $4
            WHERE terminal_id = $1 AND message_id = $2 AND status = 'PENDING'
            "#,
        )
        .bind(terminal_id)
        .bind(message_id)
        .bind(status.as_str())
        .bind(reason)
        .execute(&*self.db_pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl OfflineMessageStore for PgOfflineMessageStore {
    async fn save(&self, message: &OfflineMessage) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO offline_messages (
                terminal_id, message_id, organization_id, kind, payload, execution_mode,
                status, retry_count, max_retry_count, issued_at, created_at, expires_at,
                failure_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (terminal_id, message_id) DO UPDATE SET
                status = EXCLUDED.status,
                retry_count = EXCLUDED.retry_count,
                max_retry_count = EXCLUDED.max_retry_count,
                expires_at = EXCLUDED.expires_at,
                failure_reason = EXCLUDED.failure_reason
            "#,
        )
        .bind(&message.terminal_id)
        .bind(message.message_id)
        .bind(&message.organization_id)
        .bind(&message.kind)
        .bind(&message.payload)
        .bind(message.execution_mode.as_str())
        .bind(message.status.as_str())
        .bind(message.retry_count)
        .bind(message.max_retry_count)
        .bind(message.issued_at)
        .bind(message.created_at)
        .bind(message.expires_at)
        .bind(&message.failure_reason)
        .execute(&*self.db_pool)
        .await?;

        debug!(
            terminal_id = %message.terminal_id,
            message_id = message.message_id,
            retry_count = message.retry_count,
            "offline_message_saved"
        );
        Ok(())
    }

    async fn find_pending(&self, terminal_id: &str) -> AppResult<Vec<OfflineMessage>> {
        let rows = sqlx::query_as::<_, OfflineMessageRow>(
            r#"
            SELECT terminal_id, message_id, organization_id, kind, payload, execution_mode,
                   status, retry_count, max_retry_count, issued_at, created_at, expires_at,
                   failure_reason
            FROM offline_messages
            WHERE terminal_id = $1 AND status = 'PENDING'
            ORDER BY issued_at ASC, message_id ASC
            "#,
        )
        .bind(terminal_id)
        .fetch_all(&*self.db_pool)
        .await?;

        rows.into_iter().map(OfflineMessage::try_from).collect()
    }

    async fn mark_delivered(&self, terminal_id: &str, message_id: i32) -> AppResult<bool> {
        self.settle(terminal_id, message_id, OfflineStatus::Delivered, None)
            .await
    }

    async fn mark_failed(
        &self,
        terminal_id: &str,
        message_id: i32,
        reason: &str,
    ) -> AppResult<bool> {
        self.settle(terminal_id, message_id, OfflineStatus::Failed, Some(reason))
            .await
    }

    async fn mark_expired(&self, terminal_id: &str, message_id: i32) -> AppResult<bool> {
        self.settle(terminal_id, message_id, OfflineStatus::Expired, None)
            .await
    }

    async fn mark_superseded(&self, terminal_id: &str, message_id: i32) -> AppResult<bool> {
        self.settle(terminal_id, message_id, OfflineStatus::Superseded, None)
            .await
    }

    async fn record_retry(&self, terminal_id: &str, message_id: i32) -> AppResult<Option<i32>> {
        let retry_count = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE offline_messages
            SET retry_count = retry_count + 1
            WHERE terminal_id = $1 AND message_id = $2 AND status = 'PENDING'
            RETURNING retry_count
            "#,
        )
        .bind(terminal_id)
        .bind(message_id)
        .fetch_optional(&*self.db_pool)
        .await?;

        Ok(retry_count)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM offline_messages WHERE expires_at <= $1")
            .bind(now)
            .execute(&*self.db_pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::models::{CommandEnvelope, CommandIntent};
    use chrono::Duration;

    fn row(status: &str, execution_mode: &str) -> OfflineMessageRow {
        let now = Utc::now();
        OfflineMessageRow {
            terminal_id: "T1".into(),
            message_id: 100_001,
            organization_id: "org".into(),
            kind: "brightness".into(),
            payload: serde_json::json!({"brightness": 50}),
            execution_mode: execution_mode.into(),
            status: status.into(),
            retry_count: 0,
            max_retry_count: 3,
            issued_at: now,
            created_at: now,
            expires_at: now + Duration::hours(24),
            failure_reason: None,
        }
    }

    #[test]
    fn test_row_conversion() {
        let message = OfflineMessage::try_from(row("PENDING", "PUT")).unwrap();
        assert_eq!(message.status, OfflineStatus::Pending);
        assert_eq!(message.execution_mode, ExecutionMode::Put);

        assert!(OfflineMessage::try_from(row("LOST", "PUT")).is_err());
        assert!(OfflineMessage::try_from(row("PENDING", "PATCH")).is_err());
    }

    /// Runs against a live database when `DATABASE_URL` is set.
    #[tokio::test]
    async fn test_pending_lifecycle_against_postgres() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let repo = PgOfflineMessageStore::new(Arc::new(create_pool(&url).await.unwrap()));
        repo.ensure_schema().await.unwrap();

        let terminal_id = format!("test-{}", uuid::Uuid::new_v4());
        let envelope = CommandEnvelope::from_intent(
            100_001,
            CommandIntent {
                terminal_id: terminal_id.clone(),
                organization_id: "org".into(),
                kind: "brightness".into(),
                execution_mode: ExecutionMode::Put,
                payload: serde_json::json!({"brightness": 50}),
                expires_at: None,
            },
            Utc::now(),
        );
        let message = OfflineMessage::from_envelope(&envelope, 3, Duration::hours(24), Utc::now());
        repo.save(&message).await.unwrap();

        let pending = repo.find_pending(&terminal_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(repo.record_retry(&terminal_id, 100_001).await.unwrap(), Some(1));
        assert!(repo.mark_delivered(&terminal_id, 100_001).await.unwrap());
        assert!(repo.find_pending(&terminal_id).await.unwrap().is_empty());
    }
}
