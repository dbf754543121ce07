//! Error types for `zvault-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Crypto errors never include key material — only operation
//! descriptions.
//!
//! Subsystem errors ([`BarrierError`], [`SealError`], [`ClusterError`],
//! [`HaError`], ...) fold into [`CoreError`], which carries the taxonomy the
//! host process sees.

use serde::{Deserialize, Serialize};
use zvault_storage::StorageError;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// Ciphertext is too short to contain a valid nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    /// Key material had the wrong length.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

/// Errors from the encryption barrier.
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    /// The barrier is sealed — no operations are possible until unseal.
    #[error("vault is sealed")]
    Sealed,

    /// No keyring exists yet.
    #[error("barrier is not initialized")]
    NotInitialized,

    /// A keyring already exists.
    #[error("barrier is already initialized")]
    AlreadyInitialized,

    /// The supplied master key cannot decrypt the keyring.
    #[error("invalid master key")]
    InvalidMasterKey,

    /// The keyring decrypted but its contents are malformed.
    #[error("corrupt keyring: {reason}")]
    CorruptKeyring { reason: String },

    /// A cryptographic operation within the barrier failed.
    #[error("barrier crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The underlying storage backend returned an error.
    #[error("barrier storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from initialization and unseal share handling.
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    /// The vault has already been initialized.
    #[error("vault is already initialized")]
    AlreadyInitialized,

    /// The vault has not been initialized yet.
    #[error("vault is not initialized")]
    NotInitialized,

    /// Invalid Shamir configuration parameters.
    #[error("invalid seal config: {reason}")]
    InvalidConfig { reason: String },

    /// A submitted unseal share was malformed.
    #[error("invalid unseal share: {reason}")]
    InvalidShare { reason: String },

    /// Shamir recovery failed or produced a key of the wrong shape.
    #[error("share recovery failed: {reason}")]
    RecoveryFailed { reason: String },

    /// The encryption barrier returned an error.
    #[error("seal barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from the root token authority.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// No root token has been recorded.
    #[error("root token not found")]
    NotFound,

    /// The barrier returned an error.
    #[error("token barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from cluster identity management and TLS setup.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Cluster name/ID have not been established yet.
    #[error("cluster information has not been set up")]
    MissingInfo,

    /// The cluster private key has not been generated yet.
    #[error("cluster private key has not been generated")]
    MissingKey,

    /// The persisted key parameters are inconsistent.
    #[error("invalid cluster key parameters: {reason}")]
    InvalidKeyParams { reason: String },

    /// Key encoding or conversion failed.
    #[error("cluster key encoding failed: {reason}")]
    KeyEncoding { reason: String },

    /// Certificate generation failed.
    #[error("cluster certificate generation failed: {reason}")]
    CertGeneration { reason: String },

    /// Building a TLS configuration failed.
    #[error("cluster TLS configuration failed: {reason}")]
    Tls { reason: String },

    /// A persisted cluster record could not be (de)serialized.
    #[error("cluster record serialization failed: {reason}")]
    Serialization { reason: String },

    /// The barrier returned an error.
    #[error("cluster barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from the HA coordinator.
#[derive(Debug, thiserror::Error)]
pub enum HaError {
    /// The lock is no longer held by this node.
    #[error("HA lock lost: {reason}")]
    LockLost { reason: String },

    /// The leader advertisement could not be (de)serialized.
    #[error("invalid leader advertisement: {reason}")]
    InvalidAdvertisement { reason: String },

    /// The lock primitive failed.
    #[error("HA storage error: {0}")]
    Storage(StorageError),

    /// The barrier returned an error.
    #[error("HA barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl From<StorageError> for HaError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::LockLost { reason, .. } => Self::LockLost { reason },
            other => Self::Storage(other),
        }
    }
}

/// Errors from the host-supplied listener provider.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Binding a cluster listener failed.
    #[error("failed to bind cluster listener on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// An API address cannot be used to derive a cluster address.
    #[error("no cluster address can be derived from {addr}: {reason}")]
    Derive { addr: String, reason: String },

    /// The provider produced no listeners at all.
    #[error("listener provider returned no cluster listeners")]
    Empty,
}

/// Errors returned by logical request handling.
///
/// These cross the forwarding transport unchanged, so a standby returns
/// exactly the error the active node produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogicalError {
    /// The request is malformed for the target path.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The backend does not implement the operation.
    #[error("unsupported operation '{operation}' on path '{path}'")]
    UnsupportedOperation { operation: String, path: String },

    /// The executing node is sealed.
    #[error("vault is sealed")]
    Sealed,

    /// The executing node is no longer the active node.
    #[error("node is not the active node")]
    NotActive,

    /// The backend failed internally.
    #[error("backend error: {reason}")]
    Backend { reason: String },
}

impl From<BarrierError> for LogicalError {
    fn from(err: BarrierError) -> Self {
        match err {
            BarrierError::Sealed => Self::Sealed,
            other => Self::Backend {
                reason: other.to_string(),
            },
        }
    }
}

/// Errors from forwarding a request to the active node.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Connecting, handshaking, or exchanging HTTP/2 frames failed.
    #[error("transport failure talking to {addr}: {reason}")]
    Transport { addr: String, reason: String },

    /// The active node answered with something that is not a forwarding reply.
    #[error("malformed reply from {addr}: {reason}")]
    Protocol { addr: String, reason: String },

    /// The active node executed the request and it failed.
    #[error(transparent)]
    Remote(#[from] LogicalError),
}

/// Errors surfaced by the [`Core`](crate::node::Core) to its host.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The operation requires an unsealed vault.
    #[error("vault is sealed")]
    Sealed,

    /// The vault has not been initialized.
    #[error("vault is not initialized")]
    NotInitialized,

    /// The vault has already been initialized.
    #[error("vault is already initialized")]
    AlreadyInitialized,

    /// More unseal shares are required. Not a terminal failure.
    #[error("unseal threshold not met: {submitted} of {threshold} shares provided")]
    ThresholdNotMet { submitted: u8, threshold: u8 },

    /// The reconstructed master key was rejected by the barrier.
    #[error("invalid master key: the submitted shares do not reconstruct this vault's key")]
    InvalidMasterKey,

    /// The caller is not authorized for this operation.
    #[error("permission denied")]
    PermissionDenied,

    /// No node currently reports itself active.
    #[error("no active node is available to serve the request")]
    LeaderUnavailable,

    /// The request could not be delivered to the active node.
    #[error("request forwarding failed: {reason}")]
    ForwardFailed { reason: String },

    /// The host listener provider failed to produce cluster listeners.
    #[error("cluster listener setup failed: {reason}")]
    ListenerSetupFailed { reason: String },

    /// Configuration passed to the core is unusable.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Seal/unseal share handling failed.
    #[error(transparent)]
    Seal(SealError),

    /// The barrier returned an error.
    #[error(transparent)]
    Barrier(BarrierError),

    /// Cluster identity or TLS setup failed.
    #[error(transparent)]
    Cluster(ClusterError),

    /// The HA coordinator failed.
    #[error(transparent)]
    Ha(HaError),

    /// The logical backend rejected the request.
    #[error(transparent)]
    Logical(#[from] LogicalError),
}

impl CoreError {
    /// Whether the caller may retry the same operation and reasonably expect
    /// a different outcome.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ThresholdNotMet { .. } | Self::LeaderUnavailable | Self::ForwardFailed { .. }
        )
    }
}

impl From<BarrierError> for CoreError {
    fn from(err: BarrierError) -> Self {
        match err {
            BarrierError::Sealed => Self::Sealed,
            BarrierError::NotInitialized => Self::NotInitialized,
            BarrierError::AlreadyInitialized => Self::AlreadyInitialized,
            BarrierError::InvalidMasterKey => Self::InvalidMasterKey,
            other => Self::Barrier(other),
        }
    }
}

impl From<SealError> for CoreError {
    fn from(err: SealError) -> Self {
        match err {
            SealError::AlreadyInitialized => Self::AlreadyInitialized,
            SealError::NotInitialized => Self::NotInitialized,
            SealError::RecoveryFailed { .. } => Self::InvalidMasterKey,
            SealError::Barrier(inner) => inner.into(),
            other => Self::Seal(other),
        }
    }
}

impl From<TokenError> for CoreError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::NotFound => Self::PermissionDenied,
            TokenError::Barrier(inner) => inner.into(),
        }
    }
}

impl From<ClusterError> for CoreError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Barrier(inner) => inner.into(),
            other => Self::Cluster(other),
        }
    }
}

impl From<HaError> for CoreError {
    fn from(err: HaError) -> Self {
        match err {
            HaError::Barrier(inner) => inner.into(),
            other => Self::Ha(other),
        }
    }
}

impl From<ListenerError> for CoreError {
    fn from(err: ListenerError) -> Self {
        Self::ListenerSetupFailed {
            reason: err.to_string(),
        }
    }
}

impl From<ForwardError> for CoreError {
    fn from(err: ForwardError) -> Self {
        match err {
            // The leader's term ended while the request was in flight.
            ForwardError::Remote(LogicalError::NotActive) => Self::LeaderUnavailable,
            ForwardError::Remote(inner) => Self::Logical(inner),
            other => Self::ForwardFailed {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_sealed_maps_to_core_sealed() {
        let err: CoreError = BarrierError::Sealed.into();
        assert!(matches!(err, CoreError::Sealed));
    }

    #[test]
    fn recovery_failure_is_an_invalid_master_key() {
        let err: CoreError = SealError::RecoveryFailed {
            reason: "bad shares".to_owned(),
        }
        .into();
        assert!(matches!(err, CoreError::InvalidMasterKey));
    }

    #[test]
    fn remote_logical_errors_pass_through_forwarding() {
        let err: CoreError = ForwardError::Remote(LogicalError::Sealed).into();
        assert!(matches!(err, CoreError::Logical(LogicalError::Sealed)));

        let err: CoreError = ForwardError::Transport {
            addr: "127.0.0.1:8203".to_owned(),
            reason: "connection refused".to_owned(),
        }
        .into();
        assert!(matches!(err, CoreError::ForwardFailed { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn forwarding_into_an_ended_term_is_retryable() {
        let err: CoreError = ForwardError::Remote(LogicalError::NotActive).into();
        assert!(matches!(err, CoreError::LeaderUnavailable));
        assert!(err.is_retryable());
    }

    #[test]
    fn lock_lost_storage_error_becomes_ha_lock_lost() {
        let err: HaError = StorageError::LockLost {
            key: "core/lock".to_owned(),
            reason: "expired".to_owned(),
        }
        .into();
        assert!(matches!(err, HaError::LockLost { .. }));
    }

    #[test]
    fn logical_error_wire_shape_is_tagged() {
        let json = serde_json::to_value(LogicalError::InvalidRequest {
            reason: "missing data".to_owned(),
        })
        .unwrap_or_default();
        assert_eq!(json["kind"], "invalid_request");
        assert_eq!(json["reason"], "missing data");
    }
}
