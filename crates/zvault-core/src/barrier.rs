//! Encryption barrier for `ZVault`.
//!
//! The barrier is the most critical architectural invariant: every byte that
//! touches the storage backend passes through the barrier's encrypt/decrypt.
//! The storage layer only ever sees ciphertext.
//!
//! # Key hierarchy
//!
//! - The **master key** is reconstructed from unseal shares and never stored.
//! - The **data key** encrypts every entry. It is persisted only inside the
//!   keyring at [`KEYRING_PATH`], itself encrypted under the master key.
//! - Unsealing decrypts the keyring; an authentication failure there means
//!   the master key is wrong ([`BarrierError::InvalidMasterKey`]).
//! - Sealing drops the data key, which zeroizes it.
//!
//! Storage paths are kept in plaintext to support prefix listing.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use zeroize::Zeroizing;
use zvault_storage::StorageBackend;

use crate::crypto::{self, EncryptionKey};
use crate::error::BarrierError;

/// Storage path of the keyring (raw, encrypted under the master key).
pub const KEYRING_PATH: &str = "core/keyring";

/// Current keyring format version.
const KEYRING_VERSION: u32 = 1;

/// Keyring contents, as serialized before encryption.
#[derive(Serialize, Deserialize)]
struct Keyring {
    version: u32,
    term: u32,
    /// Base64 data encryption key.
    key: String,
}

/// The encryption barrier wrapping a storage backend.
///
/// All reads decrypt, all writes encrypt. When sealed, all operations return
/// [`BarrierError::Sealed`].
pub struct Barrier {
    storage: Arc<dyn StorageBackend>,
    key: RwLock<Option<EncryptionKey>>,
}

impl Barrier {
    /// Create a new sealed barrier wrapping the given storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            key: RwLock::new(None),
        }
    }

    /// Whether a keyring has been written.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the storage backend fails.
    pub async fn initialized(&self) -> Result<bool, BarrierError> {
        Ok(self.storage.exists(KEYRING_PATH).await?)
    }

    /// Create the keyring: generate a data key and store it encrypted under
    /// `master_key`. The barrier stays sealed.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::AlreadyInitialized`] if a keyring exists.
    /// - [`BarrierError::Crypto`] / [`BarrierError::Storage`] on failure.
    pub async fn initialize(&self, master_key: &EncryptionKey) -> Result<(), BarrierError> {
        if self.initialized().await? {
            return Err(BarrierError::AlreadyInitialized);
        }

        let data_key = EncryptionKey::generate();
        let keyring = Keyring {
            version: KEYRING_VERSION,
            term: 1,
            key: BASE64.encode(data_key.as_bytes()),
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&keyring).map_err(|e| {
            BarrierError::CorruptKeyring {
                reason: format!("failed to serialize keyring: {e}"),
            }
        })?);
        let sealed_keyring = crypto::encrypt(master_key, &plaintext)?;
        self.storage.put(KEYRING_PATH, &sealed_keyring).await?;

        info!("barrier keyring created");
        Ok(())
    }

    /// Unseal the barrier with the master key.
    ///
    /// Calling this on an unsealed barrier is a no-op.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::NotInitialized`] if no keyring exists.
    /// - [`BarrierError::InvalidMasterKey`] if the key cannot decrypt the keyring.
    /// - [`BarrierError::CorruptKeyring`] if the keyring decrypts to garbage.
    pub async fn unseal(&self, master_key: &EncryptionKey) -> Result<(), BarrierError> {
        let mut guard = self.key.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let sealed_keyring = self
            .storage
            .get(KEYRING_PATH)
            .await?
            .ok_or(BarrierError::NotInitialized)?;

        let plaintext = Zeroizing::new(
            crypto::decrypt(master_key, &sealed_keyring)
                .map_err(|_| BarrierError::InvalidMasterKey)?,
        );
        let keyring: Keyring =
            serde_json::from_slice(&plaintext).map_err(|e| BarrierError::CorruptKeyring {
                reason: e.to_string(),
            })?;
        let key_bytes = Zeroizing::new(BASE64.decode(keyring.key.as_bytes()).map_err(|e| {
            BarrierError::CorruptKeyring {
                reason: format!("data key is not base64: {e}"),
            }
        })?);
        let data_key = EncryptionKey::from_slice(&key_bytes)?;

        *guard = Some(data_key);
        debug!(term = keyring.term, "barrier unsealed");
        Ok(())
    }

    /// Seal the barrier, dropping (and thereby zeroizing) the data key.
    ///
    /// Idempotent.
    pub async fn seal(&self) {
        let mut guard = self.key.write().await;
        *guard = None;
    }

    /// Check whether the barrier is currently sealed.
    pub async fn is_sealed(&self) -> bool {
        self.key.read().await.is_none()
    }

    /// Read a value from storage, decrypting it through the barrier.
    ///
    /// Returns `Ok(None)` if the key does not exist in storage.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Crypto`] if decryption fails.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        let data_key = self.data_key().await?;

        match self.storage.get(key).await? {
            None => Ok(None),
            Some(ciphertext) => Ok(Some(crypto::decrypt(&data_key, &ciphertext)?)),
        }
    }

    /// Write a value to storage, encrypting it through the barrier.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Crypto`] if encryption fails.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        let data_key = self.data_key().await?;

        let ciphertext = crypto::encrypt(&data_key, value)?;
        self.storage.put(key, &ciphertext).await?;
        Ok(())
    }

    /// Delete a key from storage.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        self.ensure_unsealed().await?;
        self.storage.delete(key).await?;
        Ok(())
    }

    /// List keys with the given prefix.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        self.ensure_unsealed().await?;
        Ok(self.storage.list(prefix).await?)
    }

    /// Check whether a key exists in storage.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn exists(&self, key: &str) -> Result<bool, BarrierError> {
        self.ensure_unsealed().await?;
        Ok(self.storage.exists(key).await?)
    }

    /// Write raw bytes to storage WITHOUT encryption.
    ///
    /// Only for data that must be readable while sealed (the seal
    /// configuration). Never use this for secrets.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the storage backend fails.
    pub async fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        self.storage.put(key, value).await?;
        Ok(())
    }

    /// Read raw bytes from storage WITHOUT decryption.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the storage backend fails.
    pub async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        Ok(self.storage.get(key).await?)
    }

    async fn ensure_unsealed(&self) -> Result<(), BarrierError> {
        if self.key.read().await.is_some() {
            Ok(())
        } else {
            Err(BarrierError::Sealed)
        }
    }

    async fn data_key(&self) -> Result<EncryptionKey, BarrierError> {
        let guard = self.key.read().await;
        guard.clone().ok_or(BarrierError::Sealed)
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier")
            .field("sealed", &"<check with is_sealed()>")
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use zvault_storage::MemoryBackend;

    async fn initialized_barrier() -> (Barrier, EncryptionKey, Arc<MemoryBackend>) {
        let storage = Arc::new(MemoryBackend::new());
        let barrier = Barrier::new(Arc::clone(&storage) as Arc<dyn StorageBackend>);
        let master = EncryptionKey::generate();
        barrier.initialize(&master).await.unwrap();
        (barrier, master, storage)
    }

    #[tokio::test]
    async fn sealed_barrier_rejects_every_operation() {
        let (barrier, _, _) = initialized_barrier().await;
        assert!(matches!(barrier.get("k").await, Err(BarrierError::Sealed)));
        assert!(matches!(barrier.put("k", b"v").await, Err(BarrierError::Sealed)));
        assert!(matches!(barrier.delete("k").await, Err(BarrierError::Sealed)));
        assert!(matches!(barrier.list("").await, Err(BarrierError::Sealed)));
        assert!(matches!(barrier.exists("k").await, Err(BarrierError::Sealed)));
    }

    #[tokio::test]
    async fn unseal_before_initialize_fails() {
        let barrier = Barrier::new(Arc::new(MemoryBackend::new()));
        let err = barrier.unseal(&EncryptionKey::generate()).await.unwrap_err();
        assert!(matches!(err, BarrierError::NotInitialized));
    }

    #[tokio::test]
    async fn initialize_twice_fails() {
        let (barrier, master, _) = initialized_barrier().await;
        let err = barrier.initialize(&master).await.unwrap_err();
        assert!(matches!(err, BarrierError::AlreadyInitialized));
    }

    #[tokio::test]
    async fn wrong_master_key_is_rejected_and_stays_sealed() {
        let (barrier, _, _) = initialized_barrier().await;
        let err = barrier.unseal(&EncryptionKey::generate()).await.unwrap_err();
        assert!(matches!(err, BarrierError::InvalidMasterKey));
        assert!(barrier.is_sealed().await);
    }

    #[tokio::test]
    async fn storage_only_sees_ciphertext() {
        let (barrier, master, storage) = initialized_barrier().await;
        barrier.unseal(&master).await.unwrap();
        barrier.put("logical/app", b"plaintext-secret").await.unwrap();

        let raw = storage.get("logical/app").await.unwrap().unwrap();
        assert_ne!(raw, b"plaintext-secret".to_vec());
        assert!(!raw.windows(9).any(|w| w == b"plaintext"));
    }

    #[tokio::test]
    async fn data_survives_reseal_with_same_master_key() {
        let (barrier, master, _) = initialized_barrier().await;
        barrier.unseal(&master).await.unwrap();
        barrier.put("core/cluster/local/info", b"persistent").await.unwrap();
        barrier.seal().await;
        assert!(barrier.is_sealed().await);

        barrier.unseal(&master).await.unwrap();
        let val = barrier.get("core/cluster/local/info").await.unwrap();
        assert_eq!(val, Some(b"persistent".to_vec()));
    }

    #[tokio::test]
    async fn two_barriers_over_shared_storage_agree() {
        let (first, master, storage) = initialized_barrier().await;
        first.unseal(&master).await.unwrap();
        first.put("shared", b"value").await.unwrap();

        let second = Barrier::new(storage as Arc<dyn StorageBackend>);
        second.unseal(&master).await.unwrap();
        assert_eq!(second.get("shared").await.unwrap(), Some(b"value".to_vec()));
    }

    #[tokio::test]
    async fn list_and_delete_work_when_unsealed() {
        let (barrier, master, _) = initialized_barrier().await;
        barrier.unseal(&master).await.unwrap();
        barrier.put("kv/a", b"1").await.unwrap();
        barrier.put("kv/b", b"2").await.unwrap();
        assert_eq!(barrier.list("kv/").await.unwrap(), vec!["kv/a", "kv/b"]);

        barrier.delete("kv/a").await.unwrap();
        assert!(!barrier.exists("kv/a").await.unwrap());
        assert_eq!(barrier.get("kv/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn seal_is_idempotent() {
        let (barrier, master, _) = initialized_barrier().await;
        barrier.seal().await;
        barrier.unseal(&master).await.unwrap();
        barrier.seal().await;
        barrier.seal().await;
        assert!(barrier.is_sealed().await);
    }
}
