//! Opaque bearer token issuance and verification.
//!
//! Tokens are HS256 JWTs signed with a key derived from the master secret,
//! so verification needs no database access and restarting with the same
//! secret keeps previously issued tokens valid. Tokens carry no expiry;
//! rotating the master secret is the revocation mechanism.

use std::collections::HashMap;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use super::AuthError;

const MIN_MASTER_SECRET_LEN: usize = 32;

/// Claims embedded in relay tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    /// Token ID (unique per token).
    jti: String,
    /// Subject (account ID).
    sub: String,
    /// Issued at (unix seconds).
    iat: i64,
    /// Opaque caller-supplied extras, echoed back on verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    extras: Option<serde_json::Value>,
}

/// The identity a verified token resolves to.
#[derive(Debug, Clone)]
pub struct TokenIdentity {
    pub account_id: String,
    pub extras: Option<serde_json::Value>,
}

/// Issues and verifies relay bearer tokens.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    /// Positive verification results, keyed by the token string.
    cache: RwLock<HashMap<String, TokenIdentity>>,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService").finish_non_exhaustive()
    }
}

impl TokenService {
    /// Create a token service from the master secret.
    ///
    /// The signing key is `SHA-256(master_secret)` so the secret itself
    /// never sits in the signing path.
    pub fn new(master_secret: &str) -> Result<Self, AuthError> {
        if master_secret.len() < MIN_MASTER_SECRET_LEN {
            return Err(AuthError::MasterSecretTooShort(MIN_MASTER_SECRET_LEN));
        }

        let key = Sha256::digest(master_secret.as_bytes());

        // Tokens are long-lived: no exp claim, so exp validation is off.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(key.as_slice()),
            decoding_key: DecodingKey::from_secret(key.as_slice()),
            validation,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Issue a token bound to the given account.
    pub fn create(
        &self,
        account_id: &str,
        extras: Option<serde_json::Value>,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            jti: uuid::Uuid::new_v4().to_string(),
            sub: account_id.to_string(),
            iat: now_secs(),
            extras,
        };

        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)?;
        Ok(token)
    }

    /// Verify a token and resolve its identity, or `None` when the token is
    /// malformed or signed with a different secret.
    pub async fn verify(&self, token: &str) -> Option<TokenIdentity> {
        if let Some(identity) = self.cache.read().await.get(token) {
            return Some(identity.clone());
        }

        let data =
            jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation).ok()?;

        let identity = TokenIdentity {
            account_id: data.claims.sub,
            extras: data.claims.extras,
        };

        self.cache
            .write()
            .await
            .insert(token.to_string(), identity.clone());

        Some(identity)
    }
}

fn now_secs() -> i64 {
    #[allow(clippy::cast_possible_wrap)]
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    secs
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "test-master-secret-that-is-long-enough!!";

    fn test_service() -> TokenService {
        TokenService::new(TEST_SECRET).unwrap()
    }

    #[tokio::test]
    async fn issue_and_verify_roundtrip() {
        let svc = test_service();
        let token = svc.create("acc-1", None).unwrap();

        let identity = svc.verify(&token).await.unwrap();
        assert_eq!(identity.account_id, "acc-1");
        assert!(identity.extras.is_none());
    }

    #[tokio::test]
    async fn extras_are_preserved() {
        let svc = test_service();
        let token = svc
            .create("acc-1", Some(serde_json::json!({"session": "s1"})))
            .unwrap();

        let identity = svc.verify(&token).await.unwrap();
        assert_eq!(identity.extras.unwrap()["session"], "s1");
    }

    #[tokio::test]
    async fn garbage_token_fails() {
        let svc = test_service();
        assert!(svc.verify("not-a-token").await.is_none());
    }

    #[tokio::test]
    async fn wrong_secret_fails_verification() {
        let svc1 = test_service();
        let svc2 = TokenService::new("a-different-master-secret-also-long!!!!!").unwrap();

        let token = svc1.create("acc-1", None).unwrap();
        assert!(svc2.verify(&token).await.is_none());
    }

    #[tokio::test]
    async fn same_secret_accepts_tokens_across_instances() {
        let svc1 = test_service();
        let svc2 = TokenService::new(TEST_SECRET).unwrap();

        let token = svc1.create("acc-1", None).unwrap();
        let identity = svc2.verify(&token).await.unwrap();
        assert_eq!(identity.account_id, "acc-1");
    }

    #[tokio::test]
    async fn verification_is_cached() {
        let svc = test_service();
        let token = svc.create("acc-1", None).unwrap();

        svc.verify(&token).await.unwrap();
        assert!(svc.cache.read().await.contains_key(&token));

        let identity = svc.verify(&token).await.unwrap();
        assert_eq!(identity.account_id, "acc-1");
    }

    #[test]
    fn short_master_secret_is_rejected() {
        let err = TokenService::new("too-short").unwrap_err();
        assert!(matches!(err, AuthError::MasterSecretTooShort(_)));
    }

    #[test]
    fn distinct_tokens_for_same_account() {
        let svc = test_service();
        let t1 = svc.create("acc-1", None).unwrap();
        let t2 = svc.create("acc-1", None).unwrap();
        assert_ne!(t1, t2, "jti must make tokens unique");
    }
}
