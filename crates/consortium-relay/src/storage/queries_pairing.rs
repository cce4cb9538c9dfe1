//! Pairing request queries for the Consortium relay.
//!
//! A pairing request maps a client-generated ephemeral public key to a
//! pending or approved pairing. The unauthenticated poll upserts the row;
//! an authenticated client writes the wrapped response exactly once.

use super::db::{DatabaseError, RelayDatabase};
use super::models::PairingRequest;
use super::queries::unix_timestamp_ms;

impl RelayDatabase {
    /// Find or create the pairing request for a hex-encoded public key.
    pub async fn upsert_pairing_request(
        &self,
        public_key: &str,
    ) -> Result<PairingRequest, DatabaseError> {
        if let Some(request) = self.get_pairing_request(public_key).await? {
            return Ok(request);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = unix_timestamp_ms();

        sqlx::query(
            "INSERT INTO account_auth_requests (id, public_key, created_at, updated_at) \
             VALUES (?, ?, ?, ?) ON CONFLICT (public_key) DO NOTHING",
        )
        .bind(&id)
        .bind(public_key)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_pairing_request(public_key)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Pairing request {public_key}")))
    }

    /// Get a pairing request by its hex-encoded public key.
    pub async fn get_pairing_request(
        &self,
        public_key: &str,
    ) -> Result<Option<PairingRequest>, DatabaseError> {
        let request = sqlx::query_as::<_, PairingRequest>(
            "SELECT * FROM account_auth_requests WHERE public_key = ?",
        )
        .bind(public_key)
        .fetch_optional(self.pool())
        .await?;

        Ok(request)
    }

    /// Write the pairing response once.
    ///
    /// The conditional update only lands while `response` is still unset,
    /// so repeated calls (or a lost race) are silent no-ops.
    pub async fn respond_to_pairing_request(
        &self,
        public_key: &str,
        response: &str,
        response_account_id: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE account_auth_requests SET response = ?, response_account_id = ?, \
             updated_at = ? WHERE public_key = ? AND response IS NULL",
        )
        .bind(response)
        .bind(response_account_id)
        .bind(unix_timestamp_ms())
        .bind(public_key)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}
