//! Authentication for the Consortium relay.
//!
//! Covers the two halves of the login story: Ed25519 challenge-signature
//! verification, and the opaque bearer tokens handed out afterwards.

pub mod challenge;
pub mod token;

pub use challenge::verify_challenge;
pub use token::{TokenIdentity, TokenService};

/// Authentication errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Master secret must be at least {0} characters")]
    MasterSecretTooShort(usize),

    #[error("Invalid public key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid signature length: expected {expected}, got {actual}")]
    InvalidSignatureLength { expected: usize, actual: usize },

    #[error("Signature verification failed")]
    SignatureMismatch,

    #[error("Token encoding failed: {0}")]
    TokenEncoding(#[from] jsonwebtoken::errors::Error),
}
