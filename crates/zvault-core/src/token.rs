//! Root token authority.
//!
//! `Seal` and `StepDown` are privileged. The vault mints one root token at
//! initialization and stores only its SHA-256 hash behind the barrier at
//! [`ROOT_TOKEN_PATH`]. Checks compare hashes in constant time.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::barrier::Barrier;
use crate::error::TokenError;

/// Barrier path holding the hex SHA-256 of the root token.
pub const ROOT_TOKEN_PATH: &str = "core/root-token";

/// Issues and verifies the root token.
#[derive(Debug, Clone)]
pub struct TokenStore {
    barrier: Arc<Barrier>,
}

impl TokenStore {
    /// Create a token store over the given barrier.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self { barrier }
    }

    /// Mint a fresh root token and persist its hash, replacing any previous one.
    ///
    /// The plaintext token is returned once and never stored.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Barrier`] if the barrier is sealed or the write fails.
    pub async fn create_root(&self) -> Result<String, TokenError> {
        let token = uuid::Uuid::new_v4().to_string();
        let digest = hash_token(&token);
        self.barrier
            .put(ROOT_TOKEN_PATH, digest.as_bytes())
            .await?;
        info!("root token created");
        Ok(token)
    }

    /// Check whether `token` is the root token.
    ///
    /// # Errors
    ///
    /// - [`TokenError::NotFound`] if no root token has been recorded.
    /// - [`TokenError::Barrier`] if the barrier is sealed or the read fails.
    pub async fn check_root(&self, token: &str) -> Result<bool, TokenError> {
        let stored = self
            .barrier
            .get(ROOT_TOKEN_PATH)
            .await?
            .ok_or(TokenError::NotFound)?;

        let presented = hash_token(token);
        let matches: bool = presented.as_bytes().ct_eq(&stored).into();
        if !matches {
            warn!("root token check failed");
        }
        Ok(matches)
    }
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
