//! Initialization helpers for the application:
//! - tracing subscriber
//! - database connection + migrations
//! - push transport and dispatcher wiring
//! - background worker spawn helpers

use std::{path::Path, sync::Arc};

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, LogConfig};
use crate::services::{dispatcher::Dispatcher, fcm::FcmTransport, feed::FeedConsumer};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "push_dispatcher=debug,tower_http=debug".into());

    if log.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// File path of a `sqlite://` or `sqlite:` URL, without query options.
fn sqlite_path(db_url: &str) -> &str {
    let path = db_url
        .strip_prefix("sqlite://")
        .or_else(|| db_url.strip_prefix("sqlite:"))
        .unwrap_or(db_url);
    path.split('?').next().unwrap_or(path)
}

/// Initialize SQLite database connection and run migrations.
///
/// Creates the parent directory for the database file (if applicable),
/// opens a connection pool using `create_if_missing(true)` and runs migrations.
pub async fn init_db(config: &Config) -> Result<sqlx::SqlitePool> {
    let db_path = sqlite_path(&config.database.url);
    tracing::info!("Opening SQLite database at {}", db_path);

    let db_file_path = Path::new(db_path);

    if let Some(parent) = db_file_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await?;

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Build the dispatcher on top of the SQLite stores and the FCM transport.
pub fn build_dispatcher(config: &Config, pool: &sqlx::SqlitePool) -> Result<Dispatcher> {
    let transport = FcmTransport::from_config(&config.fcm)?;
    let store = Arc::new(pool.clone());

    Ok(Dispatcher::new(store.clone(), store, Arc::new(transport))
        .skip_already_sent(config.dispatch.skip_already_sent))
}

/// Spawn background workers:
/// - the change-feed consumer driving the dispatcher
///
/// Returns the `JoinHandle`s so callers can await shutdown. Each worker
/// listens for a shutdown notification on the broadcast channel.
pub fn spawn_background_workers(
    state: Arc<crate::AppState>,
    dispatcher: Dispatcher,
    shutdown: tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    if !state.config.dispatch.enabled {
        tracing::warn!("Push dispatch is disabled (DISPATCH_ENABLED=false)");
    }

    let consumer = FeedConsumer::new(state.db.clone(), dispatcher, state.config.dispatch.clone());
    handles.push(consumer.spawn(&shutdown));

    handles
}
