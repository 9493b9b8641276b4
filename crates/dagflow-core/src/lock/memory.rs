//! In-process lease lock backed by `DashMap`.

use std::time::Duration;

use chrono::Utc;
use dagflow_types::error::RepositoryError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use super::{InstanceLocker, LockLease};

/// Lease table keyed by lock name. Suitable for single-process deployments
/// and tests.
#[derive(Debug, Default)]
pub struct MemoryLocker {
    leases: DashMap<String, LockLease>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceLocker for MemoryLocker {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, RepositoryError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| RepositoryError::Query(format!("invalid lock ttl: {e}")))?;
        let lease = LockLease {
            key: key.to_string(),
            token: Uuid::now_v7(),
            expires_at: now + ttl,
        };

        match self.leases.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(lease.clone());
                Ok(Some(lease))
            }
            Entry::Occupied(mut slot) if slot.get().expires_at <= now => {
                slot.insert(lease.clone());
                Ok(Some(lease))
            }
            Entry::Occupied(_) => Ok(None),
        }
    }

    async fn unlock(&self, lease: &LockLease) -> Result<bool, RepositoryError> {
        Ok(self
            .leases
            .remove_if(&lease.key, |_, held| held.token == lease.token)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let locker = MemoryLocker::new();
        let ttl = Duration::from_secs(30);
        let lease = locker.try_lock("workflow-inst:1", ttl).await.unwrap().unwrap();
        assert!(locker.try_lock("workflow-inst:1", ttl).await.unwrap().is_none());
        // Other keys are independent.
        assert!(locker.try_lock("workflow-inst:2", ttl).await.unwrap().is_some());

        assert!(locker.unlock(&lease).await.unwrap());
        assert!(locker.try_lock("workflow-inst:1", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let locker = MemoryLocker::new();
        let stale = locker
            .try_lock("k", Duration::from_millis(0))
            .await
            .unwrap()
            .unwrap();
        let fresh = locker.try_lock("k", Duration::from_secs(30)).await.unwrap();
        assert!(fresh.is_some());

        // The stale holder can no longer release the new lease.
        assert!(!locker.unlock(&stale).await.unwrap());
    }
}
