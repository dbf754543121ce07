//! Storage error types.
//!
//! Every error variant carries enough context to diagnose the problem
//! without a debugger.

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to read a value from storage.
    #[error("failed to read key '{key}': {reason}")]
    Read { key: String, reason: String },

    /// Failed to write a value to storage.
    #[error("failed to write key '{key}': {reason}")]
    Write { key: String, reason: String },

    /// Failed to delete a key from storage.
    #[error("failed to delete key '{key}': {reason}")]
    Delete { key: String, reason: String },

    /// Failed to list keys with the given prefix.
    #[error("failed to list keys with prefix '{prefix}': {reason}")]
    List { prefix: String, reason: String },

    /// The lock primitive could not be reached or returned an error.
    #[error("lock operation on '{key}' failed: {reason}")]
    Lock { key: String, reason: String },

    /// The lock is no longer held by the caller's grant.
    #[error("lock '{key}' lost: {reason}")]
    LockLost { key: String, reason: String },
}

impl StorageError {
    /// Whether this error means the caller's lock grant is gone for good, as
    /// opposed to a transient backend failure.
    #[must_use]
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, Self::LockLost { .. })
    }
}
