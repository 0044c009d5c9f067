use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::DispatchConfig;
use crate::db::{FeedEvent, FeedEventRepository};
use crate::error::AppResult;
use crate::services::dispatcher::Dispatcher;

/// Delay before redelivering an event that has failed `deliveries` times:
/// `initial * 2^(deliveries - 1)`, capped at `max_backoff_seconds`.
pub fn backoff(config: &DispatchConfig, deliveries: u32) -> chrono::Duration {
    let exponent = deliveries.saturating_sub(1).min(32);
    let seconds = config
        .initial_backoff_seconds
        .saturating_mul(1u64 << exponent)
        .min(config.max_backoff_seconds);
    chrono::Duration::seconds(seconds as i64)
}

/// Drains the `push_notification_events` change feed into the dispatcher.
///
/// Each claimed event is one invocation of `Dispatcher::handle`. `Ok` acks
/// (deletes) the event; `Err` reschedules it with exponential backoff until
/// `max_deliveries` is reached, after which it is left in 'dead'.
#[derive(Clone)]
pub struct FeedConsumer {
    pool: SqlitePool,
    dispatcher: Dispatcher,
    config: DispatchConfig,
}

impl FeedConsumer {
    pub fn new(pool: SqlitePool, dispatcher: Dispatcher, config: DispatchConfig) -> Self {
        Self {
            pool,
            dispatcher,
            config,
        }
    }

    /// Claim one batch of due events and process it to completion.
    /// Returns the number of events claimed.
    pub async fn run_once(&self) -> AppResult<usize> {
        let stale_before =
            Utc::now().naive_utc() - chrono::Duration::seconds(self.config.claim_timeout_seconds as i64);
        let released = FeedEventRepository::release_stale_claims(&self.pool, stale_before).await?;
        if released > 0 {
            tracing::warn!("Released {} stale push notification event claims", released);
        }

        let events =
            FeedEventRepository::fetch_and_claim_due(&self.pool, self.config.batch_size as i64)
                .await?;
        let claimed = events.len();
        if claimed == 0 {
            return Ok(0);
        }

        tracing::debug!("Claimed {} push notification events", claimed);

        let handles: Vec<JoinHandle<()>> = events
            .into_iter()
            .map(|event| {
                let consumer = self.clone();
                tokio::spawn(async move { consumer.deliver(event).await })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::warn!("Push notification event task panicked: {:?}", e);
            }
        }

        Ok(claimed)
    }

    async fn deliver(&self, event: FeedEvent) {
        match self.dispatcher.handle(&event.notification_id).await {
            Ok(outcome) => {
                tracing::debug!(
                    "Push notification {} handled: {:?}",
                    event.notification_id,
                    outcome
                );
                if let Err(e) = FeedEventRepository::acknowledge(&self.pool, event.id).await {
                    // The event stays claimed and will be released as stale,
                    // which means at-least-once redelivery.
                    tracing::warn!("Failed to acknowledge event {}: {:?}", event.id, e);
                }
            }
            Err(e) => {
                let deliveries = (event.deliveries.max(0) as u32) + 1;
                let next = Utc::now().naive_utc() + backoff(&self.config, deliveries);
                match FeedEventRepository::register_failed_delivery(
                    &self.pool,
                    event.id,
                    next,
                    &e.to_string(),
                    self.config.max_deliveries as i32,
                )
                .await
                {
                    Ok(updated) if updated.status == "dead" => {
                        tracing::warn!(
                            "Push notification {} moved to dead letter after {} deliveries: {}",
                            event.notification_id,
                            updated.deliveries,
                            e
                        );
                    }
                    Ok(updated) => {
                        tracing::info!(
                            "Push notification {} will be redelivered at {} (delivery {})",
                            event.notification_id,
                            updated.next_delivery_at,
                            updated.deliveries
                        );
                    }
                    Err(update_err) => {
                        tracing::warn!(
                            "Failed to reschedule event {}: {:?}",
                            event.id,
                            update_err
                        );
                    }
                }
            }
        }
    }

    /// Spawn the polling loop. It exits when `shutdown` fires.
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let poll_interval = Duration::from_secs(self.config.poll_interval_seconds);
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    tracing::info!("Push dispatcher received shutdown signal");
                    break;
                }

                if !self.config.enabled {
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            tracing::info!("Push dispatcher shutting down");
                            break;
                        }
                        _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                    }
                    continue;
                }

                match self.run_once().await {
                    // A full batch probably means more work is waiting.
                    Ok(claimed) if claimed > 0 && claimed >= self.config.batch_size as usize => {
                        continue
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Failed to poll push notification events: {:?}", e);
                    }
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Push dispatcher shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        })
    }
}
