use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreatePushNotification, PushNotification, RecordUpdate, NO_ENDPOINTS_ERROR};
use crate::error::{AppError, AppResult};
use crate::services::dispatcher::NotificationStore;

/// Repository for the `push_notifications` queue.
///
/// Inserting a row fires the `push_notifications_on_create` trigger, which
/// appends the matching change-feed event.
pub struct PushNotificationRepository;

impl PushNotificationRepository {
    #[allow(dead_code)]
    pub async fn create(
        pool: &SqlitePool,
        notification: CreatePushNotification,
    ) -> AppResult<PushNotification> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let data_json = serde_json::to_string(&notification.data)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        let row = sqlx::query_as::<_, PushNotification>(
            r#"
            INSERT INTO push_notifications (
                id, user_id, title, body, data_json,
                is_sent, sent_at, attempts, last_error, created_at
            ) VALUES (?, ?, ?, ?, ?, 0, NULL, 0, NULL, ?)
            RETURNING
                id, user_id, title, body, data_json,
                is_sent, sent_at, attempts, last_error, created_at
            "#,
        )
        .bind(id)
        .bind(notification.user_id)
        .bind(notification.title)
        .bind(notification.body)
        .bind(data_json)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<PushNotification>> {
        let row = sqlx::query_as::<_, PushNotification>(
            r#"
            SELECT
                id, user_id, title, body, data_json,
                is_sent, sent_at, attempts, last_error, created_at
            FROM push_notifications
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Terminal write for a recipient without endpoints. `attempts` is left as is.
    pub async fn mark_no_endpoints(pool: &SqlitePool, id: &str) -> AppResult<()> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE push_notifications
            SET is_sent = 1, sent_at = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(NO_ENDPOINTS_ERROR)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        ensure_updated(result.rows_affected(), id)
    }

    /// Terminal write after a batch was submitted. A `None` error clears
    /// `last_error`.
    pub async fn mark_sent(pool: &SqlitePool, id: &str, last_error: Option<String>) -> AppResult<()> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE push_notifications
            SET is_sent = 1, sent_at = ?, attempts = attempts + 1, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(last_error)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        ensure_updated(result.rows_affected(), id)
    }

    /// Count a failed attempt without making the record terminal.
    pub async fn register_failed_attempt(
        pool: &SqlitePool,
        id: &str,
        last_error: &str,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE push_notifications
            SET attempts = attempts + 1, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(last_error)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        ensure_updated(result.rows_affected(), id)
    }
}

fn ensure_updated(rows_affected: u64, id: &str) -> AppResult<()> {
    if rows_affected == 0 {
        return Err(AppError::NotFound(format!("push notification {}", id)));
    }
    Ok(())
}

#[async_trait]
impl NotificationStore for SqlitePool {
    async fn find(&self, id: &str) -> AppResult<Option<PushNotification>> {
        PushNotificationRepository::find_by_id(self, id).await
    }

    async fn update(&self, id: &str, update: RecordUpdate) -> AppResult<()> {
        match update {
            RecordUpdate::NoEndpoints => PushNotificationRepository::mark_no_endpoints(self, id).await,
            RecordUpdate::Delivered { last_error } => {
                PushNotificationRepository::mark_sent(self, id, last_error).await
            }
            RecordUpdate::Failed { last_error } => {
                PushNotificationRepository::register_failed_attempt(self, id, &last_error).await
            }
        }
    }
}
