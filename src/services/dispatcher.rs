use std::sync::Arc;

use async_trait::async_trait;

use crate::db::{PushNotification, RecordUpdate};
use crate::error::{AppError, AppResult};
use crate::services::push::{EndpointResult, PushMessage, PushTransport};

/// Read/write access to queued notifications.
#[async_trait]
pub trait NotificationStore: Send + Sync + 'static {
    async fn find(&self, id: &str) -> AppResult<Option<PushNotification>>;

    /// Apply one of the dispatcher's partial writes. Errors with `NotFound`
    /// when the record does not exist.
    async fn update(&self, id: &str, update: RecordUpdate) -> AppResult<()>;
}

/// Narrow access to the user registry: read the endpoint set, remove tokens.
#[async_trait]
pub trait UserStore: Send + Sync + 'static {
    /// Endpoint tokens of the user, or `None` when the user does not exist.
    async fn find_endpoints(&self, user_id: &str) -> AppResult<Option<Vec<String>>>;

    /// Remove exactly `tokens` from the user's endpoint set. Tokens already
    /// absent are ignored. Returns how many were actually removed.
    async fn remove_endpoints(&self, user_id: &str, tokens: &[String]) -> AppResult<u64>;
}

/// How a single invocation ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The recipient does not exist; nothing was written.
    RecipientNotFound,
    /// The record was already terminal and the idempotency guard is on.
    AlreadySent,
    /// The recipient has no endpoints; the record was marked terminal.
    NoEndpoints,
    /// The batch was submitted and the record marked terminal.
    Delivered {
        success_count: usize,
        failure_count: usize,
        pruned: u64,
    },
}

/// Processes one queued notification to completion.
///
/// `handle` is the whole lifecycle of a record: resolve the recipient, fan
/// the message out, prune dead endpoints and record the outcome. It returns
/// `Err` only for infrastructure failures, after bumping `attempts` and
/// recording the error on the record, so the caller can schedule a retry.
#[derive(Clone)]
pub struct Dispatcher {
    notifications: Arc<dyn NotificationStore>,
    users: Arc<dyn UserStore>,
    transport: Arc<dyn PushTransport>,
    skip_already_sent: bool,
}

impl Dispatcher {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        users: Arc<dyn UserStore>,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        Self {
            notifications,
            users,
            transport,
            skip_already_sent: false,
        }
    }

    /// Return `AlreadySent` for records that are already terminal instead of
    /// delivering them again.
    pub fn skip_already_sent(mut self, skip: bool) -> Self {
        self.skip_already_sent = skip;
        self
    }

    pub async fn handle(&self, notification_id: &str) -> AppResult<DispatchOutcome> {
        match self.process(notification_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(
                    code = e.code(),
                    "Error sending push notification {}: {}",
                    notification_id,
                    e
                );

                if let Err(update_err) = self
                    .notifications
                    .update(
                        notification_id,
                        RecordUpdate::Failed {
                            last_error: e.to_string(),
                        },
                    )
                    .await
                {
                    tracing::warn!(
                        "Failed to record error on push notification {}: {}",
                        notification_id,
                        update_err
                    );
                }

                Err(e)
            }
        }
    }

    async fn process(&self, notification_id: &str) -> AppResult<DispatchOutcome> {
        let notification = self
            .notifications
            .find(notification_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("push notification {}", notification_id)))?;

        if notification.user_id.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "Push notification {} has no user_id",
                notification_id
            )));
        }

        if self.skip_already_sent && notification.is_sent {
            tracing::info!(
                "Push notification {} already sent, skipping redelivery",
                notification_id
            );
            return Ok(DispatchOutcome::AlreadySent);
        }

        let user_id = notification.user_id.as_str();
        tracing::info!("Processing push notification for user: {}", user_id);

        // Left non-terminal on purpose; see DESIGN.md (recipient not found).
        let tokens = match self.users.find_endpoints(user_id).await? {
            Some(tokens) => tokens,
            None => {
                tracing::warn!(
                    "User {} not found for push notification {}",
                    user_id,
                    notification_id
                );
                return Ok(DispatchOutcome::RecipientNotFound);
            }
        };

        if tokens.is_empty() {
            tracing::info!("No push tokens found for user {}", user_id);
            self.notifications
                .update(notification_id, RecordUpdate::NoEndpoints)
                .await?;
            return Ok(DispatchOutcome::NoEndpoints);
        }

        let message = PushMessage {
            title: notification.title.clone(),
            body: notification.body.clone(),
            data: notification.data()?,
        };

        let response = self.transport.send_multicast(&message, &tokens).await?;
        if response.responses.len() != tokens.len() {
            return Err(AppError::Push(format!(
                "Transport returned {} results for {} endpoints",
                response.responses.len(),
                tokens.len()
            )));
        }

        let success_count = response.success_count();
        let failure_count = response.failure_count();
        tracing::info!(
            "Push notification {}: {} delivered, {} failed",
            notification_id,
            success_count,
            failure_count
        );

        let invalid = invalid_endpoints(&tokens, &response.responses);
        let pruned = self.prune(user_id, &invalid).await;

        let last_error = (failure_count > 0).then(|| format!("{} failures", failure_count));
        self.notifications
            .update(notification_id, RecordUpdate::Delivered { last_error })
            .await?;

        Ok(DispatchOutcome::Delivered {
            success_count,
            failure_count,
            pruned,
        })
    }

    /// Best-effort registry cleanup. Errors are logged and swallowed so the
    /// record still reaches its terminal state.
    async fn prune(&self, user_id: &str, invalid: &[String]) -> u64 {
        if invalid.is_empty() {
            return 0;
        }

        match self.users.remove_endpoints(user_id, invalid).await {
            Ok(removed) => {
                tracing::info!(
                    "Removed {} invalid push tokens for user {}",
                    removed,
                    user_id
                );
                removed
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to remove {} invalid push tokens for user {}: {}",
                    invalid.len(),
                    user_id,
                    e
                );
                0
            }
        }
    }
}

/// Tokens whose result says the endpoint itself is dead. Retryable failures
/// are logged but kept.
fn invalid_endpoints(tokens: &[String], results: &[EndpointResult]) -> Vec<String> {
    let mut invalid = Vec::new();
    for (token, result) in tokens.iter().zip(results) {
        if let EndpointResult::Failed(failure) = result {
            tracing::debug!(
                "Error sending to token {}: {} ({})",
                token,
                failure.message,
                failure.code
            );
            if failure.code.is_permanently_invalid() && !invalid.contains(token) {
                invalid.push(token.clone());
            }
        }
    }
    invalid
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;

    use super::*;
    use crate::db::NO_ENDPOINTS_ERROR;
    use crate::services::push::{BatchResponse, DeliveryErrorCode};

    #[derive(Default)]
    pub struct MemoryNotifications {
        pub records: Mutex<HashMap<String, PushNotification>>,
        pub writes: Mutex<Vec<(String, RecordUpdate)>>,
        pub fail_writes: bool,
    }

    impl MemoryNotifications {
        pub fn with(records: Vec<PushNotification>) -> Self {
            Self {
                records: Mutex::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
                ..Default::default()
            }
        }

        pub fn get(&self, id: &str) -> PushNotification {
            self.records.lock().unwrap()[id].clone()
        }

        pub fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NotificationStore for MemoryNotifications {
        async fn find(&self, id: &str) -> AppResult<Option<PushNotification>> {
            Ok(self.records.lock().unwrap().get(id).cloned())
        }

        async fn update(&self, id: &str, update: RecordUpdate) -> AppResult<()> {
            if self.fail_writes {
                return Err(AppError::Internal(anyhow::anyhow!("store unavailable")));
            }
            let mut records = self.records.lock().unwrap();
            let record = records
                .get_mut(id)
                .ok_or_else(|| AppError::NotFound(id.to_string()))?;
            let now = chrono::Utc::now().naive_utc();
            match &update {
                RecordUpdate::NoEndpoints => {
                    record.is_sent = true;
                    record.sent_at = Some(now);
                    record.last_error = Some(NO_ENDPOINTS_ERROR.to_string());
                }
                RecordUpdate::Delivered { last_error } => {
                    record.is_sent = true;
                    record.sent_at = Some(now);
                    record.attempts += 1;
                    record.last_error = last_error.clone();
                }
                RecordUpdate::Failed { last_error } => {
                    record.attempts += 1;
                    record.last_error = Some(last_error.clone());
                }
            }
            self.writes.lock().unwrap().push((id.to_string(), update));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MemoryUsers {
        pub users: Mutex<HashMap<String, BTreeSet<String>>>,
        pub fail_removal: bool,
    }

    impl MemoryUsers {
        pub fn with(user_id: &str, tokens: &[&str]) -> Self {
            let users = Self::default();
            users.users.lock().unwrap().insert(
                user_id.to_string(),
                tokens.iter().map(|t| t.to_string()).collect(),
            );
            users
        }

        pub fn tokens(&self, user_id: &str) -> Vec<String> {
            self.users.lock().unwrap()[user_id].iter().cloned().collect()
        }
    }

    #[async_trait]
    impl UserStore for MemoryUsers {
        async fn find_endpoints(&self, user_id: &str) -> AppResult<Option<Vec<String>>> {
            Ok(self
                .users
                .lock()
                .unwrap()
                .get(user_id)
                .map(|set| set.iter().cloned().collect()))
        }

        async fn remove_endpoints(&self, user_id: &str, tokens: &[String]) -> AppResult<u64> {
            if self.fail_removal {
                return Err(AppError::Internal(anyhow::anyhow!("registry unavailable")));
            }
            let mut users = self.users.lock().unwrap();
            let Some(set) = users.get_mut(user_id) else {
                return Ok(0);
            };
            Ok(tokens.iter().filter(|t| set.remove(*t)).count() as u64)
        }
    }

    /// Transport answering from a per-token script; unscripted tokens succeed.
    #[derive(Default)]
    pub struct ScriptedTransport {
        pub script: HashMap<String, EndpointResult>,
        pub fail_with: Option<String>,
        pub calls: Mutex<Vec<(PushMessage, Vec<String>)>>,
    }

    impl ScriptedTransport {
        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PushTransport for ScriptedTransport {
        async fn send_multicast(
            &self,
            message: &PushMessage,
            tokens: &[String],
        ) -> AppResult<BatchResponse> {
            self.calls
                .lock()
                .unwrap()
                .push((message.clone(), tokens.to_vec()));
            if let Some(err) = &self.fail_with {
                return Err(AppError::Push(err.clone()));
            }
            let responses = tokens
                .iter()
                .map(|t| {
                    self.script
                        .get(t)
                        .cloned()
                        .unwrap_or_else(|| EndpointResult::Delivered {
                            message_id: format!("msg-{}", t),
                        })
                })
                .collect();
            Ok(BatchResponse { responses })
        }
    }

    pub fn notification(id: &str, user_id: &str) -> PushNotification {
        PushNotification {
            id: id.to_string(),
            user_id: user_id.to_string(),
            title: "New message".to_string(),
            body: "You have a new message".to_string(),
            data_json: r#"{"screen":"inbox"}"#.to_string(),
            is_sent: false,
            sent_at: None,
            attempts: 0,
            last_error: None,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }

    fn dispatcher(
        notifications: &Arc<MemoryNotifications>,
        users: &Arc<MemoryUsers>,
        transport: &Arc<ScriptedTransport>,
    ) -> Dispatcher {
        Dispatcher::new(notifications.clone(), users.clone(), transport.clone())
    }

    #[tokio::test]
    async fn mixed_batch_prunes_only_invalid_tokens() {
        let notifications = Arc::new(MemoryNotifications::with(vec![notification("n1", "u1")]));
        let users = Arc::new(MemoryUsers::with("u1", &["A", "B", "C"]));
        let transport = Arc::new(ScriptedTransport {
            script: HashMap::from([
                (
                    "B".to_string(),
                    EndpointResult::failed(
                        DeliveryErrorCode::RegistrationTokenNotRegistered,
                        "Requested entity was not found.",
                    ),
                ),
                (
                    "C".to_string(),
                    EndpointResult::failed(DeliveryErrorCode::Unavailable, "try again"),
                ),
            ]),
            ..Default::default()
        });

        let outcome = tokio_test::assert_ok!(
            dispatcher(&notifications, &users, &transport)
                .handle("n1")
                .await
        );

        assert_eq!(
            outcome,
            DispatchOutcome::Delivered {
                success_count: 1,
                failure_count: 2,
                pruned: 1,
            }
        );
        assert_eq!(users.tokens("u1"), vec!["A".to_string(), "C".to_string()]);

        let record = notifications.get("n1");
        assert!(record.is_sent);
        assert!(record.sent_at.is_some());
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_error.as_deref(), Some("2 failures"));
    }

    #[tokio::test]
    async fn permanent_failure_only_reports_exact_count() {
        let notifications = Arc::new(MemoryNotifications::with(vec![notification("n1", "u1")]));
        let users = Arc::new(MemoryUsers::with("u1", &["A", "B"]));
        let transport = Arc::new(ScriptedTransport {
            script: HashMap::from([(
                "B".to_string(),
                EndpointResult::failed(DeliveryErrorCode::InvalidRegistrationToken, "bad token"),
            )]),
            ..Default::default()
        });

        dispatcher(&notifications, &users, &transport)
            .handle("n1")
            .await
            .unwrap();

        assert_eq!(users.tokens("u1"), vec!["A".to_string()]);
        assert_eq!(
            notifications.get("n1").last_error.as_deref(),
            Some("1 failures")
        );
    }

    #[tokio::test]
    async fn full_success_clears_last_error() {
        let mut record = notification("n1", "u1");
        record.last_error = Some("previous failure".to_string());
        record.attempts = 2;
        let notifications = Arc::new(MemoryNotifications::with(vec![record]));
        let users = Arc::new(MemoryUsers::with("u1", &["A", "B"]));
        let transport = Arc::new(ScriptedTransport::default());

        let outcome = dispatcher(&notifications, &users, &transport)
            .handle("n1")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Delivered {
                success_count: 2,
                failure_count: 0,
                pruned: 0,
            }
        );
        let record = notifications.get("n1");
        assert!(record.is_sent);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.last_error, None);

        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (message, tokens) = &calls[0];
        assert_eq!(message.title, "New message");
        assert_eq!(message.data.get("screen").map(String::as_str), Some("inbox"));
        assert_eq!(tokens, &vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn empty_endpoint_set_is_terminal_without_transport_call() {
        let notifications = Arc::new(MemoryNotifications::with(vec![notification("n2", "u2")]));
        let users = Arc::new(MemoryUsers::with("u2", &[]));
        let transport = Arc::new(ScriptedTransport::default());

        let outcome = dispatcher(&notifications, &users, &transport)
            .handle("n2")
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::NoEndpoints);
        assert_eq!(transport.call_count(), 0);
        let record = notifications.get("n2");
        assert!(record.is_sent);
        assert!(record.sent_at.is_some());
        assert_eq!(record.last_error.as_deref(), Some(NO_ENDPOINTS_ERROR));
        assert_eq!(record.attempts, 0);
    }

    #[tokio::test]
    async fn missing_user_is_silent_noop() {
        let notifications = Arc::new(MemoryNotifications::with(vec![notification("n3", "ghost")]));
        let users = Arc::new(MemoryUsers::default());
        let transport = Arc::new(ScriptedTransport::default());

        let outcome = dispatcher(&notifications, &users, &transport)
            .handle("n3")
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::RecipientNotFound);
        assert_eq!(notifications.write_count(), 0);
        assert_eq!(transport.call_count(), 0);
        let record = notifications.get("n3");
        assert!(!record.is_sent);
        assert_eq!(record.attempts, 0);
    }

    #[tokio::test]
    async fn transport_error_records_attempt_and_propagates() {
        let notifications = Arc::new(MemoryNotifications::with(vec![notification("n4", "u1")]));
        let users = Arc::new(MemoryUsers::with("u1", &["A"]));
        let transport = Arc::new(ScriptedTransport {
            fail_with: Some("network unreachable".to_string()),
            ..Default::default()
        });

        let err = tokio_test::assert_err!(
            dispatcher(&notifications, &users, &transport)
                .handle("n4")
                .await
        );
        assert!(matches!(err, AppError::Push(_)));

        let record = notifications.get("n4");
        assert!(!record.is_sent);
        assert!(record.sent_at.is_none());
        assert_eq!(record.attempts, 1);
        assert!(record
            .last_error
            .as_deref()
            .unwrap()
            .contains("network unreachable"));
        assert_eq!(users.tokens("u1"), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn prune_failure_still_marks_terminal() {
        let notifications = Arc::new(MemoryNotifications::with(vec![notification("n5", "u1")]));
        let users = Arc::new(MemoryUsers {
            fail_removal: true,
            ..MemoryUsers::with("u1", &["A", "B"])
        });
        let transport = Arc::new(ScriptedTransport {
            script: HashMap::from([(
                "A".to_string(),
                EndpointResult::failed(DeliveryErrorCode::InvalidRegistrationToken, "bad"),
            )]),
            ..Default::default()
        });

        let outcome = dispatcher(&notifications, &users, &transport)
            .handle("n5")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Delivered {
                success_count: 1,
                failure_count: 1,
                pruned: 0,
            }
        );
        let record = notifications.get("n5");
        assert!(record.is_sent);
        assert_eq!(record.attempts, 1);
        assert_eq!(users.tokens("u1").len(), 2);
    }

    #[tokio::test]
    async fn malformed_payload_takes_failure_path() {
        let mut record = notification("n6", "u1");
        record.data_json = "[1, 2, 3]".to_string();
        let notifications = Arc::new(MemoryNotifications::with(vec![record]));
        let users = Arc::new(MemoryUsers::with("u1", &["A"]));
        let transport = Arc::new(ScriptedTransport::default());

        let err = dispatcher(&notifications, &users, &transport)
            .handle("n6")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(transport.call_count(), 0);
        let record = notifications.get("n6");
        assert!(!record.is_sent);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn empty_user_id_is_malformed() {
        let notifications = Arc::new(MemoryNotifications::with(vec![notification("n7", "")]));
        let users = Arc::new(MemoryUsers::default());
        let transport = Arc::new(ScriptedTransport::default());

        let err = dispatcher(&notifications, &users, &transport)
            .handle("n7")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(notifications.get("n7").attempts, 1);
    }

    #[tokio::test]
    async fn missing_record_propagates_even_when_bookkeeping_fails() {
        let notifications = Arc::new(MemoryNotifications::default());
        let users = Arc::new(MemoryUsers::default());
        let transport = Arc::new(ScriptedTransport::default());

        let err = dispatcher(&notifications, &users, &transport)
            .handle("missing")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(notifications.write_count(), 0);
    }

    #[tokio::test]
    async fn terminal_write_failure_propagates() {
        let notifications = Arc::new(MemoryNotifications {
            fail_writes: true,
            ..MemoryNotifications::with(vec![notification("n8", "u1")])
        });
        let users = Arc::new(MemoryUsers::with("u1", &["A"]));
        let transport = Arc::new(ScriptedTransport::default());

        let result = dispatcher(&notifications, &users, &transport)
            .handle("n8")
            .await;

        assert!(result.is_err());
        assert!(!notifications.get("n8").is_sent);
    }

    #[tokio::test]
    async fn redelivery_resends_unless_guarded() {
        let mut record = notification("n9", "u1");
        record.is_sent = true;
        record.attempts = 1;
        let notifications = Arc::new(MemoryNotifications::with(vec![record]));
        let users = Arc::new(MemoryUsers::with("u1", &["A"]));
        let transport = Arc::new(ScriptedTransport::default());

        let guarded = dispatcher(&notifications, &users, &transport).skip_already_sent(true);
        assert_eq!(
            guarded.handle("n9").await.unwrap(),
            DispatchOutcome::AlreadySent
        );
        assert_eq!(transport.call_count(), 0);

        let unguarded = dispatcher(&notifications, &users, &transport);
        unguarded.handle("n9").await.unwrap();
        assert_eq!(transport.call_count(), 1);
        assert_eq!(notifications.get("n9").attempts, 2);
    }

    #[tokio::test]
    async fn short_transport_response_is_an_error() {
        struct Truncating;

        #[async_trait]
        impl PushTransport for Truncating {
            async fn send_multicast(
                &self,
                _message: &PushMessage,
                _tokens: &[String],
            ) -> AppResult<BatchResponse> {
                Ok(BatchResponse::default())
            }
        }

        let notifications = Arc::new(MemoryNotifications::with(vec![notification("n10", "u1")]));
        let users = Arc::new(MemoryUsers::with("u1", &["A"]));
        let dispatcher = Dispatcher::new(notifications.clone(), users.clone(), Arc::new(Truncating));

        assert!(dispatcher.handle("n10").await.is_err());
        assert_eq!(notifications.get("n10").attempts, 1);
    }
}
