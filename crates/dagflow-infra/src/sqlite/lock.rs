//! Instance lock as a lease table in SQLite.
//!
//! Several engine processes sharing one database file coordinate through
//! `engine_locks`: a lease is taken by inserting its row, or by overwriting
//! a row whose lease has expired.

use std::time::Duration;

use chrono::Utc;
use dagflow_core::lock::{InstanceLocker, LockLease};
use dagflow_types::error::RepositoryError;
use uuid::Uuid;

use super::DatabasePool;
use super::rows::{format_datetime, query_err};

#[derive(Clone)]
pub struct SqliteLocker {
    pool: DatabasePool,
}

impl SqliteLocker {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl InstanceLocker for SqliteLocker {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, RepositoryError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| RepositoryError::Query(format!("invalid lock ttl: {e}")))?;
        let lease = LockLease {
            key: key.to_string(),
            token: Uuid::now_v7(),
            expires_at: now + ttl,
        };

        let result = sqlx::query(
            r#"INSERT INTO engine_locks (lock_key, token, expires_at) VALUES (?, ?, ?)
               ON CONFLICT(lock_key) DO UPDATE SET
                 token = excluded.token, expires_at = excluded.expires_at
               WHERE engine_locks.expires_at <= ?"#,
        )
        .bind(&lease.key)
        .bind(lease.token.to_string())
        .bind(format_datetime(&lease.expires_at))
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok((result.rows_affected() > 0).then_some(lease))
    }

    async fn unlock(&self, lease: &LockLease) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM engine_locks WHERE lock_key = ? AND token = ?")
            .bind(&lease.key)
            .bind(lease.token.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }
}
