use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One change-feed entry, written by the `push_notifications` insert trigger.
///
/// The feed consumer claims events, runs the dispatcher for the referenced
/// notification and deletes the event once the dispatcher returns `Ok`.
/// Failed deliveries are rescheduled with backoff and eventually moved to
/// `dead`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FeedEvent {
    pub id: i64,

    /// The notification whose creation produced this event.
    pub notification_id: String,

    /// Number of failed deliveries so far.
    pub deliveries: i32,

    pub next_delivery_at: NaiveDateTime,

    /// 'pending', 'processing' or 'dead'
    pub status: String,

    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
