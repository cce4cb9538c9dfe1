//! Account queries for the Consortium relay.

use std::time::{SystemTime, UNIX_EPOCH};

use super::db::{DatabaseError, RelayDatabase};
use super::models::Account;

/// Returns the current time in unix milliseconds.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl RelayDatabase {
    /// Get an account by ID.
    pub async fn get_account(&self, id: &str) -> Result<Account, DatabaseError> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Account {id}")))
    }

    /// Get an account by its hex-encoded public key.
    pub async fn get_account_by_public_key(
        &self,
        public_key: &str,
    ) -> Result<Option<Account>, DatabaseError> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE public_key = ?")
            .bind(public_key)
            .fetch_optional(self.pool())
            .await?;

        Ok(account)
    }

    /// Find or create the account owning the given public key.
    ///
    /// Concurrent first-logins race on the unique `public_key` index; the
    /// loser of the insert re-reads the winner's row.
    pub async fn upsert_account(&self, public_key: &str) -> Result<Account, DatabaseError> {
        if let Some(account) = self.get_account_by_public_key(public_key).await? {
            return Ok(account);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = unix_timestamp_ms();

        let inserted = sqlx::query(
            "INSERT INTO accounts (id, public_key, seq, created_at, updated_at) \
             VALUES (?, ?, 0, ?, ?) ON CONFLICT (public_key) DO NOTHING",
        )
        .bind(&id)
        .bind(public_key)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        if inserted.rows_affected() > 0 {
            self.get_account(&id).await
        } else {
            self.get_account_by_public_key(public_key)
                .await?
                .ok_or_else(|| DatabaseError::NotFound(format!("Account for key {public_key}")))
        }
    }
}
