//! Cycle-level circuit breaker for the recovery scheduler.
//!
//! Unlike a per-request breaker, this one judges whole recovery ticks. A tick
//! whose failure rate reaches the threshold counts as a failed cycle; enough
//! consecutive failed cycles open the circuit and later ticks are skipped.
//! There is no timer: each skipped tick cools the counter down by one, so the
//! circuit half-opens after a single skip and the next real tick decides.
//!
//! ```text
//!   ┌──────────┐  failed cycles >= threshold   ┌──────────┐
//!   │  CLOSED  │ ────────────────────────────▶ │   OPEN   │
//!   └──────────┘                               └──────────┘
//!        ▲                                          │
//!        │ any cycle                     skipped    │
//!        │ with successes                tick       │
//!        │                                          ▼
//!        │                                   ┌────────────┐
//!        └────────────────────────────────── │ HALF-OPEN  │
//!                                            └────────────┘
//!                                 failed cycle ──▶ OPEN
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DeliveryError, Result};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failed cycles that open the circuit.
    pub threshold: u32,
    /// Failure rate (0.0 to 1.0) at which a cycle counts as failed.
    pub failure_rate_threshold: f64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            threshold: crate::DEFAULT_CIRCUIT_BREAKER_THRESHOLD,
            failure_rate_threshold: crate::DEFAULT_FAILURE_RATE_THRESHOLD,
        }
    }
}

impl CircuitConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for a zero threshold or a
    /// failure rate outside `(0, 1]`. A zero rate would count every cycle,
    /// even a fully successful one, as failed.
    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 {
            return Err(DeliveryError::configuration("circuit breaker threshold must be positive"));
        }
        let rate = self.failure_rate_threshold;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(DeliveryError::configuration(format!(
                "circuit breaker failure rate must be within (0, 1], got {}",
                self.failure_rate_threshold
            )));
        }
        Ok(())
    }
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Ticks run normally.
    Closed,
    /// Ticks are skipped.
    Open,
    /// Cooled below the threshold; the next tick runs and decides.
    HalfOpen,
}

/// How a completed cycle affected the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleVerdict {
    /// Nothing was processed; the counter is unchanged.
    Idle,
    /// The cycle had successes below the failure rate; counter reset.
    Healthy,
    /// The cycle failed but the circuit stays closed.
    Degraded {
        /// Counter after this cycle.
        consecutive_failures: u32,
    },
    /// The cycle failed and the circuit is now open.
    Opened {
        /// Counter after this cycle.
        consecutive_failures: u32,
    },
}

/// Consecutive-failed-cycle breaker.
#[derive(Debug)]
pub struct CycleCircuitBreaker {
    config: CircuitConfig,
    consecutive_failures: AtomicU32,
    half_open: AtomicBool,
}

impl CycleCircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: CircuitConfig) -> Self {
        Self { config, consecutive_failures: AtomicU32::new(0), half_open: AtomicBool::new(false) }
    }

    /// Breaker configuration.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current counter of consecutive failed cycles.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        if self.consecutive_failures() >= self.config.threshold {
            CircuitState::Open
        } else if self.half_open.load(Ordering::SeqCst) {
            CircuitState::HalfOpen
        } else {
            CircuitState::Closed
        }
    }

    /// Whether the next tick must be skipped.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Steps the counter down for a skipped tick.
    ///
    /// The counter becomes `min(counter, threshold) - 1`, floored at zero.
    /// Returns the new value.
    pub fn cool_down(&self) -> u32 {
        let threshold = self.config.threshold;
        let step = |count: u32| count.min(threshold).saturating_sub(1);

        let previous = self
            .consecutive_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| Some(step(count)))
            .unwrap_or_else(|count| count);
        let current = step(previous);

        if previous >= threshold && current < threshold {
            self.half_open.store(true, Ordering::SeqCst);
            info!(consecutive_failures = current, "recovery circuit half-open");
        }
        current
    }

    /// Evaluates a completed cycle.
    pub fn record_cycle(&self, successes: u64, failures: u64) -> CycleVerdict {
        let total = successes + failures;
        if total == 0 {
            return CycleVerdict::Idle;
        }

        #[allow(clippy::cast_precision_loss)]
        let failure_rate = failures as f64 / total as f64;

        if failure_rate >= self.config.failure_rate_threshold {
            let count = self.consecutive_failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            self.half_open.store(false, Ordering::SeqCst);

            if count >= self.config.threshold {
                warn!(
                    consecutive_failures = count,
                    failure_rate,
                    successes,
                    failures,
                    "recovery circuit opened"
                );
                CycleVerdict::Opened { consecutive_failures: count }
            } else {
                CycleVerdict::Degraded { consecutive_failures: count }
            }
        } else {
            let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
            let was_half_open = self.half_open.swap(false, Ordering::SeqCst);
            if previous > 0 || was_half_open {
                info!(previous_failures = previous, successes, failures, "recovery circuit closed");
            }
            CycleVerdict::Healthy
        }
    }

    /// Closes the circuit immediately.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.half_open.store(false, Ordering::SeqCst);
    }
}

impl Default for CycleCircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_rate_must_be_positive_and_at_most_one() {
        let config = |failure_rate_threshold| CircuitConfig { threshold: 3, failure_rate_threshold };

        assert!(matches!(config(0.0).validate(), Err(DeliveryError::ConfigurationError { .. })));
        assert!(config(-0.5).validate().is_err());
        assert!(config(1.01).validate().is_err());
        assert!(config(f64::NAN).validate().is_err());
        assert!(config(0.01).validate().is_ok());
        assert!(config(1.0).validate().is_ok());
    }

    #[test]
    fn opens_after_threshold_failed_cycles() {
        let breaker = CycleCircuitBreaker::default();

        assert_eq!(breaker.record_cycle(0, 10), CycleVerdict::Degraded { consecutive_failures: 1 });
        assert_eq!(breaker.record_cycle(1, 9), CycleVerdict::Degraded { consecutive_failures: 2 });
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.record_cycle(2, 8), CycleVerdict::Opened { consecutive_failures: 3 });
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn failure_rate_below_threshold_resets() {
        let breaker = CycleCircuitBreaker::default();
        breaker.record_cycle(0, 5);
        breaker.record_cycle(0, 5);

        assert_eq!(breaker.record_cycle(3, 7), CycleVerdict::Healthy);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn empty_cycle_leaves_counter_alone() {
        let breaker = CycleCircuitBreaker::default();
        breaker.record_cycle(0, 1);

        assert_eq!(breaker.record_cycle(0, 0), CycleVerdict::Idle);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[test]
    fn cool_down_half_opens_and_saturates() {
        let breaker = CycleCircuitBreaker::default();
        for _ in 0..3 {
            breaker.record_cycle(0, 1);
        }

        assert_eq!(breaker.cool_down(), 2);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.cool_down(), 1);
        assert_eq!(breaker.cool_down(), 0);
        assert_eq!(breaker.cool_down(), 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CycleCircuitBreaker::default();
        for _ in 0..3 {
            breaker.record_cycle(0, 1);
        }
        breaker.cool_down();

        assert_eq!(breaker.record_cycle(0, 4), CycleVerdict::Opened { consecutive_failures: 3 });
        assert!(breaker.is_open());
    }

    #[test]
    fn half_open_success_closes() {
        let breaker = CycleCircuitBreaker::default();
        for _ in 0..3 {
            breaker.record_cycle(0, 1);
        }
        breaker.cool_down();

        assert_eq!(breaker.record_cycle(1, 0), CycleVerdict::Healthy);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn config_validation() {
        assert!(CircuitConfig::default().validate().is_ok());
        assert!(CircuitConfig { threshold: 0, ..CircuitConfig::default() }.validate().is_err());
        assert!(CircuitConfig { failure_rate_threshold: 1.5, ..CircuitConfig::default() }
            .validate()
            .is_err());
    }
}
