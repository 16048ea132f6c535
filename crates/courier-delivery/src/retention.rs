//! Retention of recovered dead letters.
//!
//! Recovered records are deleted once they are older than the retention
//! period. Records that are still dead are kept indefinitely for manual
//! intervention.

use std::{sync::Arc, time::Duration};

use courier_core::Clock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{error::Result, store::DeadLetterStore};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// How long recovered dead letters are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Age after which recovered records are deleted. Zero disables purging.
    pub recovered_ttl: Duration,
    /// Time between sweeps.
    pub sweep_interval: Duration,
}

impl RetentionPolicy {
    /// Keeps recovered records for `days` days.
    pub fn days(days: u32) -> Self {
        Self {
            recovered_ttl: Duration::from_secs(u64::from(days) * SECONDS_PER_DAY),
            ..Self::default()
        }
    }

    /// Never purges.
    pub fn disabled() -> Self {
        Self { recovered_ttl: Duration::ZERO, ..Self::default() }
    }

    /// Whether sweeps delete anything.
    pub fn is_enabled(&self) -> bool {
        !self.recovered_ttl.is_zero()
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            recovered_ttl: Duration::from_secs(
                u64::from(crate::DEFAULT_RECOVERED_RETENTION_DAYS) * SECONDS_PER_DAY,
            ),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Deletes expired recovered dead letters.
pub struct RetentionSweeper {
    store: Arc<dyn DeadLetterStore>,
    clock: Arc<dyn Clock>,
    policy: RetentionPolicy,
}

impl RetentionSweeper {
    /// Creates a sweeper.
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        clock: Arc<dyn Clock>,
        policy: RetentionPolicy,
    ) -> Self {
        Self { store, clock, policy }
    }

    /// Retention policy in force.
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Deletes recovered records older than the retention period.
    ///
    /// Returns the number of records deleted.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the delete fails.
    pub async fn sweep(&self) -> Result<u64> {
        if !self.policy.is_enabled() {
            return Ok(0);
        }

        let Some(cutoff) = chrono::Duration::from_std(self.policy.recovered_ttl)
            .ok()
            .and_then(|ttl| self.clock.now_utc().checked_sub_signed(ttl))
        else {
            return Ok(0);
        };

        let purged = self.store.purge_recovered_before(cutoff).await?;
        if purged > 0 {
            info!(purged, %cutoff, "purged recovered dead letters");
        } else {
            debug!(%cutoff, "no recovered dead letters to purge");
        }
        Ok(purged)
    }
}
