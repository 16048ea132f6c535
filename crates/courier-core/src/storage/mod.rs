//! PostgreSQL persistence for dead letters and scheduler leases.
//!
//! Repositories translate between the domain aggregates and table rows. All
//! SQL lives in this module; the delivery crate only sees the repository
//! methods through its store and lock adapters.

use std::sync::Arc;

use sqlx::PgPool;

pub mod dead_letters;
pub mod scheduler_leases;

use crate::error::Result;

/// Container for all repositories sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for dead-letter records.
    pub dead_letters: Arc<dead_letters::Repository>,

    /// Repository for recovery scheduler leases.
    pub scheduler_leases: Arc<scheduler_leases::Repository>,
}

impl Storage {
    /// Creates the repositories over a shared pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            dead_letters: Arc::new(dead_letters::Repository::new(pool.clone())),
            scheduler_leases: Arc::new(scheduler_leases::Repository::new(pool)),
        }
    }

    /// Verifies the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.dead_letters.pool()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _storage = Storage::new(pool);
    }
}
