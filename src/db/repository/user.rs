use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::db::models::User;
use crate::error::{AppError, AppResult};
use crate::services::dispatcher::UserStore;

// ============================================================================
// User Repository
// ============================================================================

pub struct UserRepository;

impl UserRepository {
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<User>> {
        let row = sqlx::query_as::<_, User>(
            r#"
            SELECT id, created_at, updated_at
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Insert the user if missing. Registration proper lives elsewhere; this
    /// exists so fixtures and operators can seed recipients.
    #[allow(dead_code)]
    pub async fn ensure(pool: &SqlitePool, id: &str) -> AppResult<User> {
        let now = Utc::now().naive_utc();
        let row = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, created_at, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at
            RETURNING id, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// The user's endpoint tokens in registration order.
    pub async fn list_push_tokens(pool: &SqlitePool, user_id: &str) -> AppResult<Vec<String>> {
        let tokens = sqlx::query_scalar::<_, String>(
            r#"
            SELECT token
            FROM user_push_tokens
            WHERE user_id = ?
            ORDER BY created_at ASC, token ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(tokens)
    }

    #[allow(dead_code)]
    pub async fn add_push_token(pool: &SqlitePool, user_id: &str, token: &str) -> AppResult<()> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            r#"
            INSERT INTO user_push_tokens (user_id, token, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id, token) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(token)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Set-difference removal of `tokens` from the user's endpoint set.
    ///
    /// A single `DELETE ... IN (...)` statement, so concurrent removals for
    /// the same user commute and tokens outside `tokens` are never touched.
    /// Tokens that are already gone simply don't match.
    pub async fn remove_push_tokens(
        pool: &SqlitePool,
        user_id: &str,
        tokens: &[String],
    ) -> AppResult<u64> {
        if tokens.is_empty() {
            return Ok(0);
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM user_push_tokens WHERE user_id = ");
        query.push_bind(user_id);
        query.push(" AND token IN (");
        let mut separated = query.separated(", ");
        for token in tokens {
            separated.push_bind(token.as_str());
        }
        separated.push_unseparated(")");

        let result = query
            .build()
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl UserStore for SqlitePool {
    async fn find_endpoints(&self, user_id: &str) -> AppResult<Option<Vec<String>>> {
        if UserRepository::find_by_id(self, user_id).await?.is_none() {
            return Ok(None);
        }
        let tokens = UserRepository::list_push_tokens(self, user_id).await?;
        Ok(Some(tokens))
    }

    async fn remove_endpoints(&self, user_id: &str, tokens: &[String]) -> AppResult<u64> {
        UserRepository::remove_push_tokens(self, user_id, tokens).await
    }
}
