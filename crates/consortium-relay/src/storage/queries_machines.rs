//! Machine queries for the Consortium relay.

use super::db::{DatabaseError, RelayDatabase};
use super::models::{Machine, VersionedWrite};
use super::queries::unix_timestamp_ms;
use super::sequencer;

impl RelayDatabase {
    /// Find or create a machine for `(account_id, id)`.
    ///
    /// Returns the machine plus, when a row was actually created, the
    /// account sequence number allocated for the `new-machine` update.
    pub async fn create_machine(
        &self,
        account_id: &str,
        machine_id: &str,
        metadata: &str,
        daemon_state: Option<&str>,
        data_encryption_key: Option<&str>,
    ) -> Result<(Machine, Option<i64>), DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let existing = sqlx::query_as::<_, Machine>(
            "SELECT * FROM machines WHERE account_id = ? AND id = ?",
        )
        .bind(account_id)
        .bind(machine_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(machine) = existing {
            tx.commit().await?;
            return Ok((machine, None));
        }

        let update_seq = sequencer::allocate_account_seq(&mut *tx, account_id).await?;

        let now = unix_timestamp_ms();
        let daemon_state_version = i64::from(daemon_state.is_some());

        sqlx::query(
            "INSERT INTO machines (id, account_id, metadata, metadata_version, daemon_state, \
             daemon_state_version, data_encryption_key, active, last_active_at, created_at, \
             updated_at) VALUES (?, ?, ?, 1, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(machine_id)
        .bind(account_id)
        .bind(metadata)
        .bind(daemon_state)
        .bind(daemon_state_version)
        .bind(data_encryption_key)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let machine = sqlx::query_as::<_, Machine>(
            "SELECT * FROM machines WHERE account_id = ? AND id = ?",
        )
        .bind(account_id)
        .bind(machine_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((machine, Some(update_seq)))
    }

    /// Get a machine by `(account_id, id)`.
    pub async fn get_machine(
        &self,
        account_id: &str,
        machine_id: &str,
    ) -> Result<Option<Machine>, DatabaseError> {
        let machine = sqlx::query_as::<_, Machine>(
            "SELECT * FROM machines WHERE account_id = ? AND id = ?",
        )
        .bind(account_id)
        .bind(machine_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(machine)
    }

    /// List all machines registered by an account.
    pub async fn list_machines(&self, account_id: &str) -> Result<Vec<Machine>, DatabaseError> {
        let machines = sqlx::query_as::<_, Machine>(
            "SELECT * FROM machines WHERE account_id = ? ORDER BY last_active_at DESC",
        )
        .bind(account_id)
        .fetch_all(self.pool())
        .await?;

        Ok(machines)
    }

    /// Version-checked write of machine metadata. Same arbitration as the
    /// session variant.
    pub async fn update_machine_metadata(
        &self,
        account_id: &str,
        machine_id: &str,
        metadata: &str,
        expected_version: i64,
    ) -> Result<Option<VersionedWrite<(Machine, i64)>>, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let Some(machine) = sqlx::query_as::<_, Machine>(
            "SELECT * FROM machines WHERE account_id = ? AND id = ?",
        )
        .bind(account_id)
        .bind(machine_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };

        if machine.metadata_version != expected_version {
            return Ok(Some(VersionedWrite::Conflict {
                version: machine.metadata_version,
                value: Some(machine.metadata),
            }));
        }

        let now = unix_timestamp_ms();
        let result = sqlx::query(
            "UPDATE machines SET metadata = ?, metadata_version = ?, updated_at = ? \
             WHERE account_id = ? AND id = ? AND metadata_version = ?",
        )
        .bind(metadata)
        .bind(expected_version + 1)
        .bind(now)
        .bind(account_id)
        .bind(machine_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let current = sqlx::query_as::<_, Machine>(
                "SELECT * FROM machines WHERE account_id = ? AND id = ?",
            )
            .bind(account_id)
            .bind(machine_id)
            .fetch_one(&mut *tx)
            .await?;
            return Ok(Some(VersionedWrite::Conflict {
                version: current.metadata_version,
                value: Some(current.metadata),
            }));
        }

        let update_seq = sequencer::allocate_account_seq(&mut *tx, account_id).await?;

        let updated = sqlx::query_as::<_, Machine>(
            "SELECT * FROM machines WHERE account_id = ? AND id = ?",
        )
        .bind(account_id)
        .bind(machine_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(VersionedWrite::Applied((updated, update_seq))))
    }

    /// Version-checked write of machine daemon state.
    pub async fn update_machine_daemon_state(
        &self,
        account_id: &str,
        machine_id: &str,
        daemon_state: Option<&str>,
        expected_version: i64,
    ) -> Result<Option<VersionedWrite<(Machine, i64)>>, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let Some(machine) = sqlx::query_as::<_, Machine>(
            "SELECT * FROM machines WHERE account_id = ? AND id = ?",
        )
        .bind(account_id)
        .bind(machine_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };

        if machine.daemon_state_version != expected_version {
            return Ok(Some(VersionedWrite::Conflict {
                version: machine.daemon_state_version,
                value: machine.daemon_state,
            }));
        }

        let now = unix_timestamp_ms();
        let result = sqlx::query(
            "UPDATE machines SET daemon_state = ?, daemon_state_version = ?, updated_at = ? \
             WHERE account_id = ? AND id = ? AND daemon_state_version = ?",
        )
        .bind(daemon_state)
        .bind(expected_version + 1)
        .bind(now)
        .bind(account_id)
        .bind(machine_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let current = sqlx::query_as::<_, Machine>(
                "SELECT * FROM machines WHERE account_id = ? AND id = ?",
            )
            .bind(account_id)
            .bind(machine_id)
            .fetch_one(&mut *tx)
            .await?;
            return Ok(Some(VersionedWrite::Conflict {
                version: current.daemon_state_version,
                value: current.daemon_state,
            }));
        }

        let update_seq = sequencer::allocate_account_seq(&mut *tx, account_id).await?;

        let updated = sqlx::query_as::<_, Machine>(
            "SELECT * FROM machines WHERE account_id = ? AND id = ?",
        )
        .bind(account_id)
        .bind(machine_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(VersionedWrite::Applied((updated, update_seq))))
    }

    /// Record a machine heartbeat.
    pub async fn set_machine_activity(
        &self,
        account_id: &str,
        machine_id: &str,
        active: bool,
        active_at: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE machines SET active = ?, last_active_at = ? WHERE account_id = ? AND id = ?",
        )
        .bind(active)
        .bind(active_at)
        .bind(account_id)
        .bind(machine_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}
