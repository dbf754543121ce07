//! Physical storage abstraction for `ZVault`.
//!
//! This crate defines the [`StorageBackend`] trait — a pure key-value storage
//! interface that knows nothing about secrets, encryption, or engines. The
//! encryption barrier in `zvault-core` wraps a storage backend to ensure all
//! data is encrypted before it reaches this layer.
//!
//! Backends that can coordinate several vault nodes additionally implement
//! [`HaBackend`], an atomic advisory-lock primitive. Leader election in
//! `zvault-core` is built entirely on top of it: whoever holds the lock is
//! the active node, and nothing else may grant that role.
//!
//! Two in-memory implementations are provided for tests and development:
//!
//! - [`MemoryBackend`] — ordered key-value store
//! - [`MemoryHaBackend`] — lock table with TTL expiry and fencing tokens

mod error;
mod ha;
mod memory;

use std::time::Duration;

pub use error::StorageError;
pub use ha::{LockGrant, LockHolder, MemoryHaBackend};
pub use memory::MemoryBackend;

/// A pluggable key-value storage backend.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g. `core/keyring`,
/// `logical/secret/app`). Values are opaque byte arrays — always encrypted
/// by the barrier before reaching storage, except for the barrier's own
/// keyring and the seal configuration.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the underlying backend fails.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a key. This is idempotent — deleting a non-existent key is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List all keys that start with the given prefix, in key order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Check whether a key exists in storage.
    ///
    /// The default implementation calls [`get`](StorageBackend::get) and checks
    /// for `Some`. Backends may override this with a more efficient check.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Atomic advisory lock primitive used for HA leader election.
///
/// The backend is the only arbiter of lock ownership: two concurrent
/// [`try_lock`](HaBackend::try_lock) calls for the same key must never both
/// succeed while the first grant is live. Liveness is TTL based — a holder
/// that stops renewing loses the lock once its TTL elapses, which is how a
/// crashed or partitioned node gives up leadership.
///
/// Every successful acquisition carries a fencing token strictly greater than
/// any previously issued for the same key.
#[async_trait::async_trait]
pub trait HaBackend: Send + Sync + 'static {
    /// Try to take the lock without blocking.
    ///
    /// Returns `Ok(None)` if another holder owns a live lock. An expired
    /// record may be taken over. `value` is published to other nodes through
    /// [`lock_holder`](HaBackend::lock_holder).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Lock`] if the backend cannot be reached.
    async fn try_lock(
        &self,
        key: &str,
        holder_id: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<Option<LockGrant>, StorageError>;

    /// Extend a held lock by `ttl` from now.
    ///
    /// # Errors
    ///
    /// - [`StorageError::LockLost`] if the record no longer carries the
    ///   grant's fencing token (expired, broken, or taken by another node).
    /// - [`StorageError::Lock`] on a transient backend failure.
    async fn renew_lock(
        &self,
        key: &str,
        grant: &LockGrant,
        ttl: Duration,
    ) -> Result<(), StorageError>;

    /// Release a held lock. Releasing a lock that is no longer held by this
    /// grant is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Lock`] if the backend cannot be reached.
    async fn release_lock(&self, key: &str, grant: &LockGrant) -> Result<(), StorageError>;

    /// Return the current live holder of the lock, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Lock`] if the backend cannot be reached.
    async fn lock_holder(&self, key: &str) -> Result<Option<LockHolder>, StorageError>;
}
