use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{AppError, AppResult};

/// A queued push notification job.
///
/// Rows are created by whatever enqueues notifications and are only ever
/// mutated by the dispatcher afterwards. `is_sent` flips to true once a
/// terminal processing attempt has been recorded; `attempts` counts every
/// attempt that reached either the delivery path or the failure path.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PushNotification {
    /// Primary key (UUID)
    pub id: String,

    /// Recipient (references `users.id`, not enforced)
    pub user_id: String,

    pub title: String,
    pub body: String,

    /// JSON object of string keys to string values, forwarded as the
    /// message's data payload.
    pub data_json: String,

    pub is_sent: bool,

    /// Set by the store when a terminal attempt is recorded.
    pub sent_at: Option<NaiveDateTime>,

    pub attempts: i32,

    /// Last error observed; cleared on a fully successful delivery.
    pub last_error: Option<String>,

    pub created_at: NaiveDateTime,
}

impl PushNotification {
    /// Decode the opaque data payload.
    ///
    /// An empty column is treated as an empty payload. Anything that is not a
    /// flat object of string values is rejected, since push data must be
    /// string-keyed and string-valued.
    pub fn data(&self) -> AppResult<HashMap<String, String>> {
        if self.data_json.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&self.data_json).map_err(|e| {
            AppError::Validation(format!(
                "Malformed data payload on notification {}: {}",
                self.id, e
            ))
        })
    }
}

/// Data required to enqueue a new push notification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreatePushNotification {
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub data: HashMap<String, String>,
}

/// Partial write applied to a queue record.
///
/// Each variant is one of the three field sets the dispatcher is allowed to
/// write. `sent_at` is assigned by the store, and attempt increments are
/// applied atomically by the store as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordUpdate {
    /// Terminal: the recipient has no registered endpoints.
    /// Sets `is_sent`, `sent_at` and `last_error`; `attempts` is untouched.
    NoEndpoints,
    /// Terminal: the batch was submitted. Sets `is_sent`, `sent_at`,
    /// `attempts + 1` and `last_error` (None clears it).
    Delivered { last_error: Option<String> },
    /// Non-terminal: the attempt failed before a terminal write.
    /// Sets `attempts + 1` and `last_error`; `is_sent` is untouched.
    Failed { last_error: String },
}

pub const NO_ENDPOINTS_ERROR: &str = "No delivery endpoints registered";
