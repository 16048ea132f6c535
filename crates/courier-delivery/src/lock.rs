//! Cross-instance exclusion for recovery ticks.
//!
//! The scheduler's running flag only guards one process. Clustered
//! deployments take a lease in the shared database before each tick so that
//! one instance recovers at a time.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_core::{error::Result, storage::Storage, Clock};
use tracing::debug;
use uuid::Uuid;

/// Lease name used by the recovery scheduler.
pub const RECOVERY_LEASE: &str = "dead-letter-recovery";

/// Exclusive right to run a recovery tick.
#[async_trait]
pub trait SchedulerLock: Send + Sync {
    /// Takes the lock. Returns `false` when another holder has it.
    async fn try_acquire(&self) -> Result<bool>;

    /// Gives the lock up if this holder still owns it.
    async fn release(&self) -> Result<()>;
}

/// Always granted. For single-instance deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLock;

#[async_trait]
impl SchedulerLock for LocalLock {
    async fn try_acquire(&self) -> Result<bool> {
        Ok(true)
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Lease row in `scheduler_leases`.
///
/// The lease expires after `ttl`, so a crashed holder blocks others for at
/// most that long.
pub struct PostgresLeaseLock {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
    name: String,
    holder: String,
    ttl: Duration,
}

impl PostgresLeaseLock {
    /// Creates a lock with a fresh holder id.
    pub fn new(
        storage: Arc<Storage>,
        clock: Arc<dyn Clock>,
        name: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self { storage, clock, name: name.into(), holder: Uuid::new_v4().to_string(), ttl }
    }

    /// This instance's holder id.
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

#[async_trait]
impl SchedulerLock for PostgresLeaseLock {
    async fn try_acquire(&self) -> Result<bool> {
        let now = self.clock.now_utc();
        let ttl =
            chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::minutes(5));

        let acquired = self
            .storage
            .scheduler_leases
            .try_acquire(&self.name, &self.holder, now, now + ttl)
            .await?;
        debug!(lease = %self.name, holder = %self.holder, acquired, "scheduler lease attempt");
        Ok(acquired)
    }

    async fn release(&self) -> Result<()> {
        self.storage.scheduler_leases.release(&self.name, &self.holder).await
    }
}

#[cfg(test)]
mod tests {
    use courier_core::RealClock;

    use super::*;

    #[tokio::test]
    async fn local_lock_always_grants() {
        let lock = LocalLock;
        assert!(lock.try_acquire().await.unwrap());
        assert!(lock.try_acquire().await.unwrap());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn lease_holders_are_unique() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let storage = Arc::new(Storage::new(pool));
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

        let ttl = Duration::from_secs(60);
        let a = PostgresLeaseLock::new(storage.clone(), clock.clone(), RECOVERY_LEASE, ttl);
        let b = PostgresLeaseLock::new(storage, clock, RECOVERY_LEASE, ttl);

        assert_ne!(a.holder(), b.holder());
    }
}
