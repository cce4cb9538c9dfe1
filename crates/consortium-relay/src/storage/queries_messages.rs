//! Session message queries for the Consortium relay.

use super::db::{DatabaseError, RelayDatabase};
use super::models::SessionMessage;
use super::queries::unix_timestamp_ms;
use super::sequencer;

/// Messages returned by a single listing, newest first.
pub const MESSAGE_LIST_LIMIT: i64 = 150;

impl RelayDatabase {
    /// Append a message to a session.
    ///
    /// Re-sends carrying an already-seen `(session_id, local_id)` pair are
    /// dropped and return `None`. Otherwise the message is stamped with the
    /// next session seq and the account seq allocated for the `new-message`
    /// update is returned alongside the row.
    pub async fn insert_message(
        &self,
        account_id: &str,
        session_id: &str,
        content: &str,
        local_id: Option<&str>,
    ) -> Result<Option<(SessionMessage, i64)>, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        if let Some(local_id) = local_id {
            let duplicate: Option<(String,)> = sqlx::query_as(
                "SELECT id FROM session_messages WHERE session_id = ? AND local_id = ?",
            )
            .bind(session_id)
            .bind(local_id)
            .fetch_optional(&mut *tx)
            .await?;

            if duplicate.is_some() {
                tx.commit().await?;
                return Ok(None);
            }
        }

        let message_seq = sequencer::allocate_session_seq(&mut *tx, session_id).await?;
        let update_seq = sequencer::allocate_account_seq(&mut *tx, account_id).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = unix_timestamp_ms();

        sqlx::query(
            "INSERT INTO session_messages (id, session_id, seq, content, local_id, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(session_id)
        .bind(message_seq)
        .bind(content)
        .bind(local_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        let message =
            sqlx::query_as::<_, SessionMessage>("SELECT * FROM session_messages WHERE id = ?")
                .bind(&id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;

        Ok(Some((message, update_seq)))
    }

    /// List the most recent messages for a session, newest first.
    pub async fn list_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<SessionMessage>, DatabaseError> {
        let messages = sqlx::query_as::<_, SessionMessage>(
            "SELECT * FROM session_messages WHERE session_id = ? \
             ORDER BY created_at DESC, seq DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(MESSAGE_LIST_LIMIT)
        .fetch_all(self.pool())
        .await?;

        Ok(messages)
    }
}
