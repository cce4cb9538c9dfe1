//! Session queries for the Consortium relay.

use super::db::{DatabaseError, RelayDatabase};
use super::models::{Session, VersionedWrite};
use super::queries::unix_timestamp_ms;
use super::sequencer;

/// Sessions returned by a single listing, newest updates first.
pub const SESSION_LIST_LIMIT: i64 = 150;

impl RelayDatabase {
    /// Find or create a session for `(account_id, tag)`.
    ///
    /// Returns the session plus, when a row was actually created, the
    /// account sequence number allocated for the `new-session` update.
    /// Re-posting an existing tag returns the stored row unchanged.
    pub async fn create_session(
        &self,
        account_id: &str,
        tag: &str,
        metadata: &str,
        agent_state: Option<&str>,
        data_encryption_key: Option<&str>,
    ) -> Result<(Session, Option<i64>), DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let existing = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE account_id = ? AND tag = ?",
        )
        .bind(account_id)
        .bind(tag)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(session) = existing {
            tx.commit().await?;
            return Ok((session, None));
        }

        let update_seq = sequencer::allocate_account_seq(&mut *tx, account_id).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = unix_timestamp_ms();
        let agent_state_version = i64::from(agent_state.is_some());

        sqlx::query(
            "INSERT INTO sessions (id, account_id, tag, seq, metadata, metadata_version, \
             agent_state, agent_state_version, data_encryption_key, active, last_active_at, \
             created_at, updated_at) \
             VALUES (?, ?, ?, 0, ?, 1, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(&id)
        .bind(account_id)
        .bind(tag)
        .bind(metadata)
        .bind(agent_state)
        .bind(agent_state_version)
        .bind(data_encryption_key)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok((session, Some(update_seq)))
    }

    /// Get a session by ID.
    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, DatabaseError> {
        let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        Ok(session)
    }

    /// List the account's most-recently-updated sessions.
    pub async fn list_sessions(&self, account_id: &str) -> Result<Vec<Session>, DatabaseError> {
        let sessions = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE account_id = ? ORDER BY updated_at DESC LIMIT ?",
        )
        .bind(account_id)
        .bind(SESSION_LIST_LIMIT)
        .fetch_all(self.pool())
        .await?;

        Ok(sessions)
    }

    /// Delete a session and all its messages.
    ///
    /// Ownership is verified inside the transaction; deleting a missing or
    /// foreign session returns `false` with nothing written.
    pub async fn delete_session(
        &self,
        account_id: &str,
        session_id: &str,
    ) -> Result<bool, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let owned: Option<(String,)> =
            sqlx::query_as("SELECT account_id FROM sessions WHERE id = ?")
                .bind(session_id)
                .fetch_optional(&mut *tx)
                .await?;

        match owned {
            Some((owner,)) if owner == account_id => {}
            _ => {
                tx.commit().await?;
                return Ok(false);
            }
        }

        sqlx::query("DELETE FROM session_messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(true)
    }

    /// Version-checked write of session metadata.
    ///
    /// On success the returned session carries `metadata_version =
    /// expected_version + 1` and the account seq allocated for the
    /// `update-session` event. Any version disagreement, including a lost
    /// race with a concurrent writer, reports the stored version and value
    /// without writing.
    pub async fn update_session_metadata(
        &self,
        account_id: &str,
        session_id: &str,
        metadata: &str,
        expected_version: i64,
    ) -> Result<Option<VersionedWrite<(Session, i64)>>, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let Some(session) = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };
        if session.account_id != account_id {
            return Ok(None);
        }

        if session.metadata_version != expected_version {
            return Ok(Some(VersionedWrite::Conflict {
                version: session.metadata_version,
                value: Some(session.metadata),
            }));
        }

        let now = unix_timestamp_ms();
        let result = sqlx::query(
            "UPDATE sessions SET metadata = ?, metadata_version = ?, updated_at = ? \
             WHERE id = ? AND metadata_version = ?",
        )
        .bind(metadata)
        .bind(expected_version + 1)
        .bind(now)
        .bind(session_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let current = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
                .bind(session_id)
                .fetch_one(&mut *tx)
                .await?;
            return Ok(Some(VersionedWrite::Conflict {
                version: current.metadata_version,
                value: Some(current.metadata),
            }));
        }

        let update_seq = sequencer::allocate_account_seq(&mut *tx, account_id).await?;

        let updated = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(VersionedWrite::Applied((updated, update_seq))))
    }

    /// Version-checked write of session agent state. Same arbitration as
    /// [`RelayDatabase::update_session_metadata`].
    pub async fn update_session_agent_state(
        &self,
        account_id: &str,
        session_id: &str,
        agent_state: Option<&str>,
        expected_version: i64,
    ) -> Result<Option<VersionedWrite<(Session, i64)>>, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let Some(session) = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };
        if session.account_id != account_id {
            return Ok(None);
        }

        if session.agent_state_version != expected_version {
            return Ok(Some(VersionedWrite::Conflict {
                version: session.agent_state_version,
                value: session.agent_state,
            }));
        }

        let now = unix_timestamp_ms();
        let result = sqlx::query(
            "UPDATE sessions SET agent_state = ?, agent_state_version = ?, updated_at = ? \
             WHERE id = ? AND agent_state_version = ?",
        )
        .bind(agent_state)
        .bind(expected_version + 1)
        .bind(now)
        .bind(session_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let current = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
                .bind(session_id)
                .fetch_one(&mut *tx)
                .await?;
            return Ok(Some(VersionedWrite::Conflict {
                version: current.agent_state_version,
                value: current.agent_state,
            }));
        }

        let update_seq = sequencer::allocate_account_seq(&mut *tx, account_id).await?;

        let updated = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(VersionedWrite::Applied((updated, update_seq))))
    }

    /// Record a session heartbeat without touching the update ordering.
    pub async fn set_session_activity(
        &self,
        session_id: &str,
        active: bool,
        active_at: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE sessions SET active = ?, last_active_at = ? WHERE id = ?")
            .bind(active)
            .bind(active_at)
            .bind(session_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }
}
