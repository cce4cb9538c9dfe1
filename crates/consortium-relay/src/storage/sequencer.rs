//! Atomic monotonic sequence allocation.
//!
//! Both counters are incremented with a single conditional UPDATE so that
//! concurrent allocations for the same key serialize inside SQLite and the
//! returned values are strictly increasing with no gaps or duplicates. The
//! read-modify-write never happens at the application level.

use sqlx::{Executor, Sqlite};

use super::db::{DatabaseError, RelayDatabase};
use super::queries::unix_timestamp_ms;

impl RelayDatabase {
    /// Allocate the next per-account event sequence number.
    pub async fn allocate_account_seq(&self, account_id: &str) -> Result<i64, DatabaseError> {
        allocate_account_seq(self.pool(), account_id).await
    }

    /// Allocate the next per-session message sequence number.
    pub async fn allocate_session_seq(&self, session_id: &str) -> Result<i64, DatabaseError> {
        allocate_session_seq(self.pool(), session_id).await
    }
}

/// Post-increment the account counter on any executor (pool or transaction).
pub async fn allocate_account_seq<'e, E>(executor: E, account_id: &str) -> Result<i64, DatabaseError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(i64,)> = sqlx::query_as(
        "UPDATE accounts SET seq = seq + 1, updated_at = ? WHERE id = ? RETURNING seq",
    )
    .bind(unix_timestamp_ms())
    .bind(account_id)
    .fetch_optional(executor)
    .await?;

    row.map(|(seq,)| seq)
        .ok_or_else(|| DatabaseError::NotFound(format!("Account {account_id}")))
}

/// Post-increment the session counter on any executor (pool or transaction).
pub async fn allocate_session_seq<'e, E>(executor: E, session_id: &str) -> Result<i64, DatabaseError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(i64,)> =
        sqlx::query_as("UPDATE sessions SET seq = seq + 1 WHERE id = ? RETURNING seq")
            .bind(session_id)
            .fetch_optional(executor)
            .await?;

    row.map(|(seq,)| seq)
        .ok_or_else(|| DatabaseError::NotFound(format!("Session {session_id}")))
}
