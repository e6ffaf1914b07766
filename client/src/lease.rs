//! TTL-bounded sync lease stored in the device database.
//!
//! Acquisition is a single conditional upsert: it succeeds when the lease is
//! free, expired, or already ours. A crashed holder stops renewing and the
//! lease lapses after its TTL.

use crate::db::{to_millis, Pool};
use crate::error::Result;
use std::time::Duration;
use tillsync_engine::{Error, Timestamp};

const SYNC_LEASE: &str = "sync";

#[derive(Debug, Clone)]
pub struct LeaseLock {
    pool: Pool,
    holder: String,
    ttl: Duration,
}

impl LeaseLock {
    pub fn new(pool: Pool, holder: impl Into<String>, ttl: Duration) -> Self {
        Self {
            pool,
            holder: holder.into(),
            ttl,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Take (or renew) the lease, failing with `SyncLockHeld` when another
    /// holder's lease has not expired.
    pub async fn acquire(&self, now: Timestamp) -> Result<()> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(2));
        let result = sqlx::query(
            r#"
            INSERT INTO sync_lease (name, holder, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE sync_lease.holder = excluded.holder OR sync_lease.expires_at <= ?
            "#,
        )
        .bind(SYNC_LEASE)
        .bind(&self.holder)
        .bind(to_millis(now + ttl))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let holder: Option<(String,)> =
            sqlx::query_as("SELECT holder FROM sync_lease WHERE name = ?")
                .bind(SYNC_LEASE)
                .fetch_optional(&self.pool)
                .await?;
        Err(Error::SyncLockHeld {
            holder: holder.map_or_else(|| "unknown".to_string(), |(h,)| h),
        }
        .into())
    }

    /// Give the lease up if we still hold it.
    pub async fn release(&self) -> Result<()> {
        sqlx::query("DELETE FROM sync_lease WHERE name = ? AND holder = ?")
            .bind(SYNC_LEASE)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
