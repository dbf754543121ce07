//! In-memory HA lock table.
//!
//! Models the atomic lock primitive a shared storage service (Consul
//! sessions, etcd leases, a SQL row with a compare-and-swap update) would
//! offer. All mutation happens under a single async mutex, which makes every
//! operation linearizable from the callers' point of view: the first
//! `try_lock` to reach the table wins and later ones observe the holder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::{HaBackend, StorageError};

/// Proof of a successful lock acquisition.
///
/// Only the holder that received the grant can renew or release the lock;
/// the fencing token identifies this particular acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    /// Identity of the node that holds the lock.
    pub holder_id: String,
    /// Monotonically increasing per-key acquisition counter.
    pub fencing_token: u64,
}

/// The current live holder of a lock, as seen by any node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    /// Identity of the holding node.
    pub holder_id: String,
    /// Value published by the holder at acquisition time.
    pub value: String,
    /// Fencing token of the current acquisition.
    pub fencing_token: u64,
}

#[derive(Debug)]
struct LockRecord {
    holder_id: String,
    value: String,
    fencing_token: u64,
    expires_at: Instant,
}

impl LockRecord {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Default)]
struct LockTable {
    records: HashMap<String, LockRecord>,
    /// Last issued fencing token per key, kept even after release.
    tokens: HashMap<String, u64>,
}

/// In-memory [`HaBackend`].
///
/// Clones share the same table, so every `Core` built from a clone of one
/// `MemoryHaBackend` competes for the same locks.
#[derive(Debug, Clone, Default)]
pub struct MemoryHaBackend {
    table: Arc<Mutex<LockTable>>,
}

impl MemoryHaBackend {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forcibly remove a lock record, as if the holder's session expired.
    ///
    /// The fencing counter is preserved, so the previous holder's renewals
    /// fail with [`StorageError::LockLost`].
    pub async fn break_lock(&self, key: &str) {
        let mut table = self.table.lock().await;
        if let Some(record) = table.records.remove(key) {
            debug!(key, holder = %record.holder_id, "lock broken");
        }
    }
}

#[async_trait::async_trait]
impl HaBackend for MemoryHaBackend {
    async fn try_lock(
        &self,
        key: &str,
        holder_id: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<Option<LockGrant>, StorageError> {
        let now = Instant::now();
        let mut table = self.table.lock().await;

        if let Some(existing) = table.records.get(key) {
            if existing.is_live(now) {
                return Ok(None);
            }
            debug!(key, previous_holder = %existing.holder_id, "taking over expired lock");
        }

        let next = table.tokens.get(key).copied().unwrap_or(0).saturating_add(1);
        table.tokens.insert(key.to_owned(), next);
        table.records.insert(
            key.to_owned(),
            LockRecord {
                holder_id: holder_id.to_owned(),
                value: value.to_owned(),
                fencing_token: next,
                expires_at: now + ttl,
            },
        );

        Ok(Some(LockGrant {
            holder_id: holder_id.to_owned(),
            fencing_token: next,
        }))
    }

    async fn renew_lock(
        &self,
        key: &str,
        grant: &LockGrant,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let now = Instant::now();
        let mut table = self.table.lock().await;

        match table.records.get_mut(key) {
            Some(record) if record.fencing_token == grant.fencing_token && record.is_live(now) => {
                record.expires_at = now + ttl;
                Ok(())
            }
            Some(record) if record.fencing_token == grant.fencing_token => {
                Err(StorageError::LockLost {
                    key: key.to_owned(),
                    reason: "lock TTL expired before renewal".to_owned(),
                })
            }
            Some(record) => Err(StorageError::LockLost {
                key: key.to_owned(),
                reason: format!("lock now held by '{}'", record.holder_id),
            }),
            None => Err(StorageError::LockLost {
                key: key.to_owned(),
                reason: "lock record no longer exists".to_owned(),
            }),
        }
    }

    async fn release_lock(&self, key: &str, grant: &LockGrant) -> Result<(), StorageError> {
        let mut table = self.table.lock().await;
        let held = table
            .records
            .get(key)
            .is_some_and(|r| r.fencing_token == grant.fencing_token);
        if held {
            table.records.remove(key);
        }
        Ok(())
    }

    async fn lock_holder(&self, key: &str) -> Result<Option<LockHolder>, StorageError> {
        let now = Instant::now();
        let table = self.table.lock().await;
        Ok(table
            .records
            .get(key)
            .filter(|r| r.is_live(now))
            .map(|r| LockHolder {
                holder_id: r.holder_id.clone(),
                value: r.value.clone(),
                fencing_token: r.fencing_token,
            }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const KEY: &str = "core/lock";
    const TTL: Duration = Duration::from_secs(15);

    #[tokio::test]
    async fn first_writer_wins() {
        let ha = MemoryHaBackend::new();
        let a = ha.try_lock(KEY, "node-a", "adv-a", TTL).await.unwrap();
        let b = ha.try_lock(KEY, "node-b", "adv-b", TTL).await.unwrap();
        assert!(a.is_some());
        assert!(b.is_none());

        let holder = ha.lock_holder(KEY).await.unwrap().unwrap();
        assert_eq!(holder.holder_id, "node-a");
        assert_eq!(holder.value, "adv-a");
    }

    #[tokio::test]
    async fn concurrent_acquisitions_grant_exactly_one() {
        let ha = MemoryHaBackend::new();
        let mut handles = Vec::new();
        for i in 0..16 {
            let ha = ha.clone();
            handles.push(tokio::spawn(async move {
                ha.try_lock(KEY, &format!("node-{i}"), "v", TTL).await.unwrap()
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn release_allows_next_holder_with_higher_token() {
        let ha = MemoryHaBackend::new();
        let a = ha.try_lock(KEY, "node-a", "v", TTL).await.unwrap().unwrap();
        ha.release_lock(KEY, &a).await.unwrap();
        assert!(ha.lock_holder(KEY).await.unwrap().is_none());

        let b = ha.try_lock(KEY, "node-b", "v", TTL).await.unwrap().unwrap();
        assert!(b.fencing_token > a.fencing_token);
    }

    #[tokio::test]
    async fn stale_release_does_not_drop_new_holder() {
        let ha = MemoryHaBackend::new();
        let a = ha.try_lock(KEY, "node-a", "v", TTL).await.unwrap().unwrap();
        ha.break_lock(KEY).await;
        let b = ha.try_lock(KEY, "node-b", "v", TTL).await.unwrap().unwrap();

        ha.release_lock(KEY, &a).await.unwrap();
        let holder = ha.lock_holder(KEY).await.unwrap().unwrap();
        assert_eq!(holder.fencing_token, b.fencing_token);
    }

    #[tokio::test]
    async fn renew_after_break_reports_lock_lost() {
        let ha = MemoryHaBackend::new();
        let a = ha.try_lock(KEY, "node-a", "v", TTL).await.unwrap().unwrap();
        ha.renew_lock(KEY, &a, TTL).await.unwrap();

        ha.break_lock(KEY).await;
        let err = ha.renew_lock(KEY, &a, TTL).await.unwrap_err();
        assert!(err.is_lock_lost());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_can_be_taken_over() {
        let ha = MemoryHaBackend::new();
        let a = ha
            .try_lock(KEY, "node-a", "v", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(ha.lock_holder(KEY).await.unwrap().is_none());

        let b = ha.try_lock(KEY, "node-b", "v", TTL).await.unwrap();
        assert!(b.is_some());
        let err = ha.renew_lock(KEY, &a, TTL).await.unwrap_err();
        assert!(err.is_lock_lost());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_extends_lifetime() {
        let ha = MemoryHaBackend::new();
        let ttl = Duration::from_secs(3);
        let a = ha.try_lock(KEY, "node-a", "v", ttl).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        ha.renew_lock(KEY, &a, ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let holder = ha.lock_holder(KEY).await.unwrap().unwrap();
        assert_eq!(holder.holder_id, "node-a");
    }
}
