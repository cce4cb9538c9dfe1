//! Ed25519 challenge-signature verification.
//!
//! Login proves possession of the account keypair by signing a
//! client-chosen challenge. The relay only ever verifies; it holds no
//! signing keys of its own.

use ed25519_dalek::{Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};

use super::AuthError;

/// Verify that `signature` is a valid Ed25519 signature of `challenge`
/// under `public_key` (raw 32-byte key).
pub fn verify_challenge(
    public_key: &[u8],
    challenge: &[u8],
    signature: &[u8],
) -> Result<(), AuthError> {
    let key_bytes: &[u8; PUBLIC_KEY_LENGTH] =
        public_key
            .try_into()
            .map_err(|_| AuthError::InvalidKeyLength {
                expected: PUBLIC_KEY_LENGTH,
                actual: public_key.len(),
            })?;

    let key = VerifyingKey::from_bytes(key_bytes).map_err(|_| AuthError::SignatureMismatch)?;

    let signature: Signature =
        signature
            .try_into()
            .map_err(|_| AuthError::InvalidSignatureLength {
                expected: SIGNATURE_LENGTH,
                actual: signature.len(),
            })?;

    key.verify(challenge, &signature)
        .map_err(|_| AuthError::SignatureMismatch)
}
