//! Key-share reconstruction for `ZVault`.
//!
//! The master key is split with Shamir's Secret Sharing at init time and
//! handed to operators as base64 shares. The flow is:
//!
//! 1. **Init**: generate the master key, create the barrier keyring under
//!    it, persist the share configuration, split the key into N shares with
//!    threshold T. The shares are returned once and never stored.
//!
//! 2. **Unseal**: operators submit shares one at a time. Shares accumulate
//!    in memory; once T distinct shares are present the master key is
//!    reconstructed and handed back to the caller, and the buffer is wiped.
//!
//! The seal configuration lives at [`SEAL_CONFIG_PATH`] outside the barrier
//! so the threshold is known while sealed. Neither shares nor the master key
//! ever touch storage.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sharks::{Share, Sharks};
use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::barrier::Barrier;
use crate::crypto::{EncryptionKey, KEY_LEN};
use crate::error::SealError;

/// Storage key for the seal configuration (raw, unencrypted).
pub const SEAL_CONFIG_PATH: &str = "core/seal-config";

/// Upper bound on the number of shares a vault can be split into.
pub const MAX_SHARES: u8 = 10;

/// Persisted seal configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealConfig {
    /// Total number of unseal shares.
    pub shares: u8,
    /// Minimum shares required to reconstruct the master key.
    pub threshold: u8,
}

impl SealConfig {
    /// Validate Shamir parameters.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::InvalidConfig`] if the share count is outside
    /// `1..=10`, the threshold exceeds the share count, or a split into
    /// several shares would let any single share unseal the vault.
    pub fn validate(self) -> Result<(), SealError> {
        let Self { shares, threshold } = self;
        if !(1..=MAX_SHARES).contains(&shares) {
            return Err(SealError::InvalidConfig {
                reason: format!("share count must be 1-{MAX_SHARES}, got {shares}"),
            });
        }
        if threshold == 0 || threshold > shares {
            return Err(SealError::InvalidConfig {
                reason: format!("threshold must be between 1 and {shares}, got {threshold}"),
            });
        }
        if shares > 1 && threshold < 2 {
            return Err(SealError::InvalidConfig {
                reason: "threshold must be at least 2 when splitting into several shares"
                    .to_owned(),
            });
        }
        Ok(())
    }
}

/// Output of [`SealManager::init`].
pub struct SealInit {
    /// Base64-encoded unseal key shares. Shown once, never stored.
    pub shares: Vec<String>,
    /// The freshly generated master key, for the caller's one-time bootstrap.
    pub master_key: EncryptionKey,
}

impl std::fmt::Debug for SealInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealInit")
            .field("shares", &self.shares.len())
            .finish_non_exhaustive()
    }
}

/// Progress of an ongoing unseal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsealProgress {
    /// Total threshold required.
    pub threshold: u8,
    /// Number of distinct shares submitted so far.
    pub submitted: u8,
}

/// Result of submitting one share.
#[derive(Debug)]
pub enum ShareOutcome {
    /// More shares are needed.
    Pending(UnsealProgress),
    /// The threshold was reached; the buffer has been wiped.
    Reconstructed(EncryptionKey),
}

/// Current seal status of the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    /// Whether the vault has been initialized.
    pub initialized: bool,
    /// Whether the barrier is currently sealed.
    pub sealed: bool,
    /// Threshold of shares required to unseal.
    pub threshold: u8,
    /// Total number of shares.
    pub shares: u8,
    /// Number of shares submitted so far in the current unseal attempt.
    pub progress: u8,
}

/// Accumulates unseal shares and reconstructs the master key.
pub struct SealManager {
    barrier: Arc<Barrier>,
    pending_shares: Mutex<Vec<Zeroizing<Vec<u8>>>>,
}

impl SealManager {
    /// Create a new seal manager over the given barrier.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self {
            barrier,
            pending_shares: Mutex::new(Vec::new()),
        }
    }

    /// Initialize a new vault.
    ///
    /// The barrier is left **sealed**.
    ///
    /// # Errors
    ///
    /// - [`SealError::InvalidConfig`] if share count or threshold are out of bounds.
    /// - [`SealError::AlreadyInitialized`] if the vault has already been initialized.
    /// - [`SealError::Barrier`] if keyring creation or storage fails.
    pub async fn init(&self, shares: u8, threshold: u8) -> Result<SealInit, SealError> {
        let config = SealConfig { shares, threshold };
        config.validate()?;

        if self.is_initialized().await? {
            return Err(SealError::AlreadyInitialized);
        }

        let master_key = EncryptionKey::generate();
        self.barrier.initialize(&master_key).await?;

        let config_bytes = serde_json::to_vec(&config).map_err(|e| SealError::InvalidConfig {
            reason: format!("failed to serialize seal config: {e}"),
        })?;
        self.barrier.put_raw(SEAL_CONFIG_PATH, &config_bytes).await?;

        let dealer = Sharks(threshold).dealer(master_key.as_bytes());
        let encoded = dealer
            .take(usize::from(shares))
            .map(|share| BASE64.encode(Vec::from(&share)))
            .collect();

        info!(shares, threshold, "vault initialized");
        Ok(SealInit {
            shares: encoded,
            master_key,
        })
    }

    /// Submit one base64 unseal share.
    ///
    /// Resubmitting a share already in the buffer does not advance progress.
    ///
    /// # Errors
    ///
    /// - [`SealError::NotInitialized`] if the vault hasn't been initialized.
    /// - [`SealError::InvalidShare`] if the share is malformed. The buffer
    ///   is left untouched.
    /// - [`SealError::RecoveryFailed`] if reconstruction fails. The buffer is
    ///   wiped.
    pub async fn submit_unseal_share(&self, share_b64: &str) -> Result<ShareOutcome, SealError> {
        let config = self.load_config().await?;

        let share_bytes = Zeroizing::new(BASE64.decode(share_b64.trim()).map_err(|e| {
            SealError::InvalidShare {
                reason: format!("base64 decode failed: {e}"),
            }
        })?);
        Share::try_from(share_bytes.as_slice()).map_err(|e| SealError::InvalidShare {
            reason: e.to_owned(),
        })?;

        let mut pending = self.pending_shares.lock().await;
        if pending.iter().any(|s| **s == *share_bytes) {
            debug!("duplicate unseal share ignored");
        } else {
            pending.push(share_bytes);
        }

        let submitted = u8::try_from(pending.len()).unwrap_or(u8::MAX);
        if submitted < config.threshold {
            return Ok(ShareOutcome::Pending(UnsealProgress {
                threshold: config.threshold,
                submitted,
            }));
        }

        let buffered = std::mem::take(&mut *pending);
        drop(pending);

        let master_key = reconstruct(config.threshold, &buffered)?;
        debug!(threshold = config.threshold, "master key reconstructed");
        Ok(ShareOutcome::Reconstructed(master_key))
    }

    /// Discard any partially submitted shares.
    pub async fn reset(&self) {
        self.pending_shares.lock().await.clear();
    }

    /// Number of shares currently buffered.
    pub async fn progress(&self) -> u8 {
        u8::try_from(self.pending_shares.lock().await.len()).unwrap_or(u8::MAX)
    }

    /// Check whether the vault has been initialized.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Barrier`] if the storage backend fails.
    pub async fn is_initialized(&self) -> Result<bool, SealError> {
        Ok(self.barrier.initialized().await?)
    }

    /// Get the current seal status.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Barrier`] if the storage backend fails.
    pub async fn status(&self) -> Result<SealStatus, SealError> {
        let initialized = self.is_initialized().await?;
        let sealed = self.barrier.is_sealed().await;

        let (threshold, shares, progress) = if initialized {
            let config = self.load_config().await?;
            (config.threshold, config.shares, self.progress().await)
        } else {
            (0, 0, 0)
        };

        Ok(SealStatus {
            initialized,
            sealed,
            threshold,
            shares,
            progress,
        })
    }

    /// Load the seal configuration from storage.
    ///
    /// # Errors
    ///
    /// - [`SealError::NotInitialized`] if no configuration exists.
    /// - [`SealError::InvalidConfig`] if the stored record is unreadable.
    pub async fn load_config(&self) -> Result<SealConfig, SealError> {
        let config_bytes = self
            .barrier
            .get_raw(SEAL_CONFIG_PATH)
            .await?
            .ok_or(SealError::NotInitialized)?;

        serde_json::from_slice(&config_bytes).map_err(|e| SealError::InvalidConfig {
            reason: format!("failed to deserialize seal config: {e}"),
        })
    }
}

impl std::fmt::Debug for SealManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealManager")
            .field("barrier", &self.barrier)
            .finish_non_exhaustive()
    }
}

fn reconstruct(threshold: u8, buffered: &[Zeroizing<Vec<u8>>]) -> Result<EncryptionKey, SealError> {
    let shares = buffered
        .iter()
        .map(|bytes| {
            Share::try_from(bytes.as_slice()).map_err(|e| SealError::InvalidShare {
                reason: e.to_owned(),
            })
        })
        .collect::<Result<Vec<Share>, _>>()?;

    let secret = Zeroizing::new(Sharks(threshold).recover(&shares).map_err(|e| {
        SealError::RecoveryFailed {
            reason: e.to_owned(),
        }
    })?);

    if secret.len() != KEY_LEN {
        return Err(SealError::RecoveryFailed {
            reason: format!("recovered key is {} bytes, expected {KEY_LEN}", secret.len()),
        });
    }
    EncryptionKey::from_slice(&secret).map_err(|e| SealError::RecoveryFailed {
        reason: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use zvault_storage::MemoryBackend;

    use super::*;

    fn key_of(outcome: ShareOutcome) -> Option<EncryptionKey> {
        match outcome {
            ShareOutcome::Reconstructed(key) => Some(key),
            ShareOutcome::Pending(_) => None,
        }
    }

    fn manager() -> (SealManager, Arc<Barrier>) {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        (SealManager::new(Arc::clone(&barrier)), barrier)
    }

    #[test]
    fn config_bounds() {
        assert!(SealConfig { shares: 1, threshold: 1 }.validate().is_ok());
        assert!(SealConfig { shares: 5, threshold: 3 }.validate().is_ok());
        assert!(SealConfig { shares: 10, threshold: 10 }.validate().is_ok());
        assert!(SealConfig { shares: 0, threshold: 0 }.validate().is_err());
        assert!(SealConfig { shares: 11, threshold: 3 }.validate().is_err());
        assert!(SealConfig { shares: 3, threshold: 4 }.validate().is_err());
        assert!(SealConfig { shares: 3, threshold: 1 }.validate().is_err());
    }

    #[tokio::test]
    async fn threshold_shares_reconstruct_master_key() {
        let (seal, barrier) = manager();
        let init = seal.init(5, 3).await.unwrap();
        assert_eq!(init.shares.len(), 5);
        assert!(barrier.is_sealed().await);

        for share in &init.shares[..2] {
            let outcome = seal.submit_unseal_share(share).await.unwrap();
            assert!(matches!(outcome, ShareOutcome::Pending(_)));
        }
        let outcome = seal.submit_unseal_share(&init.shares[4]).await.unwrap();
        let key = key_of(outcome).unwrap();
        assert_eq!(key.as_bytes(), init.master_key.as_bytes());
        assert_eq!(seal.progress().await, 0);

        barrier.unseal(&key).await.unwrap();
        assert!(!barrier.is_sealed().await);
    }

    #[tokio::test]
    async fn single_share_vault_unseals_with_one_share() {
        let (seal, _) = manager();
        let init = seal.init(1, 1).await.unwrap();
        let outcome = seal.submit_unseal_share(&init.shares[0]).await.unwrap();
        assert!(matches!(outcome, ShareOutcome::Reconstructed(_)));
    }

    #[tokio::test]
    async fn duplicate_share_does_not_advance_progress() {
        let (seal, _) = manager();
        let init = seal.init(3, 2).await.unwrap();

        seal.submit_unseal_share(&init.shares[0]).await.unwrap();
        let outcome = seal.submit_unseal_share(&init.shares[0]).await.unwrap();
        assert!(matches!(
            outcome,
            ShareOutcome::Pending(UnsealProgress {
                threshold: 2,
                submitted: 1
            })
        ));
    }

    #[tokio::test]
    async fn malformed_share_is_rejected_without_touching_buffer() {
        let (seal, _) = manager();
        let init = seal.init(3, 2).await.unwrap();
        seal.submit_unseal_share(&init.shares[0]).await.unwrap();

        let err = seal.submit_unseal_share("not base64!!").await.unwrap_err();
        assert!(matches!(err, SealError::InvalidShare { .. }));
        assert_eq!(seal.progress().await, 1);
    }

    #[tokio::test]
    async fn reset_discards_progress() {
        let (seal, _) = manager();
        let init = seal.init(3, 2).await.unwrap();
        seal.submit_unseal_share(&init.shares[1]).await.unwrap();
        seal.reset().await;
        assert_eq!(seal.status().await.unwrap().progress, 0);
    }

    #[tokio::test]
    async fn shares_from_another_vault_yield_a_key_the_barrier_rejects() {
        let (seal, barrier) = manager();
        seal.init(3, 2).await.unwrap();
        let (other, _) = manager();
        let foreign = other.init(3, 2).await.unwrap();

        seal.submit_unseal_share(&foreign.shares[0]).await.unwrap();
        let outcome = seal.submit_unseal_share(&foreign.shares[1]).await.unwrap();
        let key = key_of(outcome).unwrap();
        let err = barrier.unseal(&key).await.unwrap_err();
        assert!(matches!(err, crate::error::BarrierError::InvalidMasterKey));
    }

    #[tokio::test]
    async fn init_twice_fails() {
        let (seal, _) = manager();
        seal.init(3, 2).await.unwrap();
        let err = seal.init(3, 2).await.unwrap_err();
        assert!(matches!(err, SealError::AlreadyInitialized));
    }

    #[tokio::test]
    async fn status_before_init() {
        let (seal, _) = manager();
        let status = seal.status().await.unwrap();
        assert!(!status.initialized);
        assert!(status.sealed);
        assert_eq!(status.threshold, 0);

        let err = seal.submit_unseal_share("AQID").await.unwrap_err();
        assert!(matches!(err, SealError::NotInitialized));
    }
}
