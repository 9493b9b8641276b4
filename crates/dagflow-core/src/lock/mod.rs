//! Per-instance mutual exclusion.
//!
//! Every mutation of one workflow instance (drive, operator commands, timeout
//! handling) runs under the lease for `workflow-inst:{inst_id}`. Leases carry
//! a TTL so a crashed holder cannot wedge an instance forever.

pub mod memory;

pub use memory::MemoryLocker;

use std::time::Duration;

use chrono::{DateTime, Utc};
use dagflow_types::config::LockConfig;
use dagflow_types::error::{EngineError, RepositoryError};
use tracing::{debug, warn};
use uuid::Uuid;

/// A held lock. Only the holder's `token` can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Lease-based lock port.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait InstanceLocker: Send + Sync + 'static {
    /// Take the lock if it is free or its previous lease has expired.
    fn try_lock(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<Option<LockLease>, RepositoryError>> + Send;

    /// Release a lease. Returns `false` when the lease was already lost.
    fn unlock(
        &self,
        lease: &LockLease,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}

/// Lock key for one workflow instance.
pub fn instance_lock_key(inst_id: i64) -> String {
    format!("workflow-inst:{inst_id}")
}

/// Acquire `key`, retrying with linear backoff.
///
/// Exhausting the attempts yields `EngineError::Retryable`, so bus consumers
/// redeliver the message later instead of dead-lettering it.
pub async fn acquire_with_retry<L: InstanceLocker + ?Sized>(
    locker: &L,
    key: &str,
    config: &LockConfig,
) -> Result<LockLease, EngineError> {
    let ttl = Duration::from_millis(config.ttl_ms);
    let attempts = config.retry_attempts.max(1);
    for attempt in 1..=attempts {
        if let Some(lease) = locker.try_lock(key, ttl).await? {
            return Ok(lease);
        }
        if attempt < attempts {
            debug!(key, attempt, "lock busy, backing off");
            tokio::time::sleep(Duration::from_millis(config.retry_backoff_ms * u64::from(attempt)))
                .await;
        }
    }
    Err(EngineError::retryable(format!("lock {key} is busy")))
}

/// Release a lease, logging instead of failing: an unreleased lease simply
/// expires after its TTL.
pub async fn release<L: InstanceLocker + ?Sized>(locker: &L, lease: &LockLease) {
    match locker.unlock(lease).await {
        Ok(true) => {}
        Ok(false) => warn!(key = %lease.key, "lock lease expired before release"),
        Err(e) => warn!(key = %lease.key, error = %e, "failed to release lock"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> LockConfig {
        LockConfig {
            ttl_ms: 60_000,
            retry_attempts: 3,
            retry_backoff_ms: 1,
        }
    }

    #[test]
    fn test_instance_lock_key_format() {
        assert_eq!(instance_lock_key(42), "workflow-inst:42");
    }

    #[tokio::test]
    async fn test_acquire_with_retry_gives_up_as_retryable() {
        let locker = MemoryLocker::new();
        let held = acquire_with_retry(&locker, "k", &fast_config()).await.unwrap();

        let err = acquire_with_retry(&locker, "k", &fast_config()).await.unwrap_err();
        assert!(err.is_retryable());

        release(&locker, &held).await;
        assert!(acquire_with_retry(&locker, "k", &fast_config()).await.is_ok());
    }
}
