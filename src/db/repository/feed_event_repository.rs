use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;

use crate::db::models::FeedEvent;
use crate::error::{AppError, AppResult};

/// Repository for the `push_notification_events` change feed.
///
/// Implementation notes:
/// - Claiming uses an atomic single-statement UPDATE with a subselect:
///   `UPDATE ... WHERE id = (SELECT id ... LIMIT 1) RETURNING ...`
///   so two consumers never claim the same event.
/// - Acknowledged events are deleted; dead events stay for inspection.
pub struct FeedEventRepository;

impl FeedEventRepository {
    /// Return events stuck in `processing` since before `claimed_before` to
    /// `pending`, so a crashed consumer does not lose them.
    pub async fn release_stale_claims(
        pool: &SqlitePool,
        claimed_before: NaiveDateTime,
    ) -> AppResult<u64> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE push_notification_events
            SET status = 'pending', updated_at = ?
            WHERE status = 'processing' AND updated_at <= ?
            "#,
        )
        .bind(now)
        .bind(claimed_before)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    /// Claim up to `limit` due events, oldest schedule first.
    pub async fn fetch_and_claim_due(pool: &SqlitePool, limit: i64) -> AppResult<Vec<FeedEvent>> {
        let mut events: Vec<FeedEvent> = Vec::new();
        if limit <= 0 {
            return Ok(events);
        }

        for _ in 0..(limit as usize) {
            let now = Utc::now().naive_utc();

            let opt = sqlx::query_as::<_, FeedEvent>(
                r#"
                UPDATE push_notification_events
                SET status = 'processing', updated_at = ?
                WHERE id = (
                    SELECT id FROM push_notification_events
                    WHERE status = 'pending'
                      AND next_delivery_at <= ?
                    ORDER BY next_delivery_at ASC, id ASC
                    LIMIT 1
                )
                RETURNING
                    id,
                    notification_id,
                    deliveries,
                    next_delivery_at,
                    status,
                    last_error,
                    created_at,
                    updated_at
                "#,
            )
            .bind(now)
            .bind(now)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

            match opt {
                Some(event) => events.push(event),
                None => break,
            }
        }

        Ok(events)
    }

    /// The dispatcher finished with the event; drop it from the feed.
    pub async fn acknowledge(pool: &SqlitePool, id: i64) -> AppResult<()> {
        sqlx::query("DELETE FROM push_notification_events WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    /// Count a failed delivery and schedule the next one. Once
    /// `max_deliveries` is reached the event is moved to 'dead' instead.
    pub async fn register_failed_delivery(
        pool: &SqlitePool,
        id: i64,
        next_delivery_at: NaiveDateTime,
        last_error: &str,
        max_deliveries: i32,
    ) -> AppResult<FeedEvent> {
        let now = Utc::now().naive_utc();
        let row = sqlx::query_as::<_, FeedEvent>(
            r#"
            UPDATE push_notification_events
            SET
                deliveries = deliveries + 1,
                next_delivery_at = ?,
                last_error = ?,
                status = CASE WHEN deliveries + 1 >= ? THEN 'dead' ELSE 'pending' END,
                updated_at = ?
            WHERE id = ?
            RETURNING
                id,
                notification_id,
                deliveries,
                next_delivery_at,
                status,
                last_error,
                created_at,
                updated_at
            "#,
        )
        .bind(next_delivery_at)
        .bind(last_error)
        .bind(max_deliveries)
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    #[allow(dead_code)]
    pub async fn find_by_notification(
        pool: &SqlitePool,
        notification_id: &str,
    ) -> AppResult<Vec<FeedEvent>> {
        let rows = sqlx::query_as::<_, FeedEvent>(
            r#"
            SELECT
                id,
                notification_id,
                deliveries,
                next_delivery_at,
                status,
                last_error,
                created_at,
                updated_at
            FROM push_notification_events
            WHERE notification_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(notification_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}
