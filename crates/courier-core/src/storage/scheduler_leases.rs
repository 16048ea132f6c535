//! Repository for named scheduler leases.
//!
//! A lease row grants one holder the right to run a periodic job until it
//! expires. Acquiring succeeds when the row is absent, expired, or already
//! held by the caller, so a live holder can renew its own lease.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::Result;

/// Repository for lease rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Takes or renews the lease `name` for `holder` until `expires_at`.
    ///
    /// Returns `false` when another holder owns an unexpired lease.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO scheduler_leases (name, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE scheduler_leases.holder = EXCLUDED.holder
               OR scheduler_leases.expires_at <= $4
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Drops the lease if `holder` still owns it.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn release(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM scheduler_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }
}
