//! HA coordination on top of the storage lock primitive.
//!
//! Leadership is exactly "holding the lock at [`LOCK_KEY`]". The
//! coordinator never arbitrates on its own: whichever `try_lock` the
//! backend grants first wins, and a node that cannot renew stops being
//! active.
//!
//! The lock value is an advertisement ID. The active node writes its
//! addresses and certificate to [`LEADER_PREFIX`]`<id>` behind the barrier,
//! which is how standbys find it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zvault_storage::{HaBackend, LockGrant, LockHolder};

use crate::barrier::Barrier;
use crate::error::HaError;

/// Storage key of the leadership lock.
pub const LOCK_KEY: &str = "core/lock";

/// Barrier prefix of leader advertisements.
pub const LEADER_PREFIX: &str = "core/leader/";

/// Timing knobs for election, heartbeat, and teardown.
///
/// Passed to the core at construction; tests shrink these instead of
/// touching anything global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaTiming {
    /// Lifetime of a lock grant without renewal.
    pub lock_ttl: Duration,
    /// How often the active node renews the lock.
    pub heartbeat_interval: Duration,
    /// Pause between failed acquisition attempts on a standby.
    pub lock_retry_interval: Duration,
    /// How long a node that stepped down refrains from re-acquiring.
    pub step_down_cooldown: Duration,
    /// Bound on waiting for background tasks to unwind.
    pub teardown_grace: Duration,
    /// Bound on one forwarded request round trip.
    pub forward_timeout: Duration,
    /// Bound on one inbound TLS handshake.
    pub handshake_timeout: Duration,
}

impl HaTiming {
    /// How long an active node trusts its lease without a renewal: one
    /// heartbeat short of `lock_ttl`.
    #[must_use]
    pub fn lease_margin(&self) -> Duration {
        self.lock_ttl.saturating_sub(self.heartbeat_interval)
    }
}

impl Default for HaTiming {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(5),
            lock_retry_interval: Duration::from_secs(10),
            step_down_cooldown: Duration::from_secs(10),
            teardown_grace: Duration::from_secs(2),
            forward_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// What the active node tells standbys about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderAdvertisement {
    pub node_id: String,
    pub advertise_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_addr: Option<String>,
    /// Base64 DER certificate served on the cluster port.
    pub cluster_cert: String,
}

/// A live lock grant.
///
/// Dropping the handle does not release the lock; call [`Lock::release`]
/// or let the TTL lapse.
pub struct Lock {
    backend: Arc<dyn HaBackend>,
    grant: LockGrant,
}

impl Lock {
    /// Fencing token of this acquisition.
    #[must_use]
    pub fn fencing_token(&self) -> u64 {
        self.grant.fencing_token
    }

    /// Extend the lock by `ttl`.
    ///
    /// # Errors
    ///
    /// - [`HaError::LockLost`] if the grant is no longer current.
    /// - [`HaError::Storage`] on a transient backend failure.
    pub async fn renew(&self, ttl: Duration) -> Result<(), HaError> {
        self.backend.renew_lock(LOCK_KEY, &self.grant, ttl).await?;
        Ok(())
    }

    /// Release the lock. A no-op if it is already gone.
    ///
    /// # Errors
    ///
    /// Returns [`HaError::Storage`] if the backend cannot be reached.
    pub async fn release(&self) -> Result<(), HaError> {
        self.backend.release_lock(LOCK_KEY, &self.grant).await?;
        debug!(fencing_token = self.grant.fencing_token, "HA lock released");
        Ok(())
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("grant", &self.grant)
            .finish_non_exhaustive()
    }
}

/// Front end over the HA backend.
#[derive(Clone)]
pub struct Coordinator {
    backend: Arc<dyn HaBackend>,
    node_id: String,
}

impl Coordinator {
    #[must_use]
    pub fn new(backend: Arc<dyn HaBackend>, node_id: impl Into<String>) -> Self {
        Self {
            backend,
            node_id: node_id.into(),
        }
    }

    /// Try once to take leadership, publishing `advertisement_id` as the
    /// lock value.
    ///
    /// # Errors
    ///
    /// Returns [`HaError::Storage`] if the backend cannot be reached.
    pub async fn try_acquire(
        &self,
        advertisement_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lock>, HaError> {
        let grant = self
            .backend
            .try_lock(LOCK_KEY, &self.node_id, advertisement_id, ttl)
            .await?;
        Ok(grant.map(|grant| Lock {
            backend: Arc::clone(&self.backend),
            grant,
        }))
    }

    /// The current lock holder, if any.
    ///
    /// # Errors
    ///
    /// Returns [`HaError::Storage`] if the backend cannot be reached.
    pub async fn holder(&self) -> Result<Option<LockHolder>, HaError> {
        Ok(self.backend.lock_holder(LOCK_KEY).await?)
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Why an active term ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldOutcome {
    /// The term was cancelled locally (step-down or seal).
    Released,
    /// The lock could not be kept.
    Lost { reason: String },
}

/// Heartbeat the lock until the term is cancelled or the lock is lost.
///
/// A definite loss ends the term at once. Transient backend errors are
/// retried on the next beat, but every renewal races the lease deadline:
/// one heartbeat short of `lock_ttl` after the last renewal was sent. A
/// backend that fails or hangs past that point ends the term before
/// another node can be granted the lock.
pub async fn hold(lock: &Lock, timing: &HaTiming, term: &CancellationToken) -> HoldOutcome {
    let mut last_renewed = Instant::now();
    let mut ticker = tokio::time::interval_at(
        Instant::now() + timing.heartbeat_interval,
        timing.heartbeat_interval,
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let deadline = last_renewed + timing.lease_margin();
        tokio::select! {
            biased;
            () = term.cancelled() => return HoldOutcome::Released,
            () = tokio::time::sleep_until(deadline) => {
                return HoldOutcome::Lost {
                    reason: format!("no successful renewal for {:?}", last_renewed.elapsed()),
                };
            }
            _ = ticker.tick() => {}
        }

        let sent = Instant::now();
        let renewed = tokio::select! {
            biased;
            () = term.cancelled() => return HoldOutcome::Released,
            result = tokio::time::timeout_at(deadline, lock.renew(timing.lock_ttl)) => result,
        };

        match renewed {
            Ok(Ok(())) => last_renewed = sent,
            Ok(Err(HaError::LockLost { reason })) => return HoldOutcome::Lost { reason },
            Ok(Err(e)) => warn!(error = %e, "HA lock renewal failed, retrying"),
            Err(_) => {
                return HoldOutcome::Lost {
                    reason: format!(
                        "renewal did not complete within {:?} of the last one",
                        timing.lease_margin()
                    ),
                };
            }
        }
    }
}

/// Sleep for `duration` unless `cancel` fires first. Returns `false` if
/// cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

/// Persist the active node's advertisement.
///
/// # Errors
///
/// - [`HaError::InvalidAdvertisement`] if it cannot be serialized.
/// - [`HaError::Barrier`] if the barrier is sealed or storage fails.
pub async fn publish_advertisement(
    barrier: &Barrier,
    id: &str,
    advertisement: &LeaderAdvertisement,
) -> Result<(), HaError> {
    let bytes =
        serde_json::to_vec(advertisement).map_err(|e| HaError::InvalidAdvertisement {
            reason: e.to_string(),
        })?;
    barrier.put(&format!("{LEADER_PREFIX}{id}"), &bytes).await?;
    Ok(())
}

/// Load an advertisement by ID.
///
/// # Errors
///
/// - [`HaError::InvalidAdvertisement`] for a corrupt record.
/// - [`HaError::Barrier`] if the barrier is sealed or storage fails.
pub async fn load_advertisement(
    barrier: &Barrier,
    id: &str,
) -> Result<Option<LeaderAdvertisement>, HaError> {
    let Some(bytes) = barrier.get(&format!("{LEADER_PREFIX}{id}")).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| HaError::InvalidAdvertisement {
            reason: e.to_string(),
        })
}

/// Remove an advertisement.
///
/// # Errors
///
/// Returns [`HaError::Barrier`] if the barrier is sealed or storage fails.
pub async fn clear_advertisement(barrier: &Barrier, id: &str) -> Result<(), HaError> {
    barrier.delete(&format!("{LEADER_PREFIX}{id}")).await?;
    Ok(())
}
