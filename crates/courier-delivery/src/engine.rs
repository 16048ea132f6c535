//! Recovery engine: background tasks around the scheduler.
//!
//! The engine owns two tasks. The recovery loop runs a tick, then sleeps for
//! the fixed delay, so ticks never overlap and a slow tick pushes the next one
//! back. The retention loop purges expired recovered dead letters on its own
//! interval. Both stop on the engine's cancellation token.
//!
//! ```text
//! ┌────────────────┐  tick   ┌───────────────────┐  page   ┌──────────────┐
//! │ RecoveryEngine │───────▶ │ RecoveryScheduler │───────▶ │ EventPublish │
//! └────────────────┘         └───────────────────┘         └──────────────┘
//!        │ sweep                      │ outcomes
//!        ▼                            ▼
//! ┌──────────────────┐        ┌─────────────────┐
//! │ RetentionSweeper │──────▶ │ DeadLetterStore │
//! └──────────────────┘        └─────────────────┘
//! ```

use std::{sync::Arc, time::Duration};

use courier_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    circuit::CircuitConfig,
    error::{DeliveryError, Result},
    lock::SchedulerLock,
    retention::{RetentionPolicy, RetentionSweeper},
    scheduler::{RecoveryScheduler, RecoveryStats, TickOutcome},
    service::EventPublishing,
    store::DeadLetterStore,
};

/// Configuration for the recovery engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Pause between the end of one tick and the start of the next.
    pub fixed_delay: Duration,

    /// Dead letters fetched and republished per page.
    pub batch_size: usize,

    /// Failed retries after which a dead letter is no longer retried.
    pub max_retry: u32,

    /// Cycle circuit breaker settings.
    pub circuit: CircuitConfig,

    /// Retention of recovered dead letters.
    pub retention: RetentionPolicy,

    /// Maximum time to wait for background tasks on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            fixed_delay: Duration::from_millis(crate::DEFAULT_FIXED_DELAY_MS),
            batch_size: crate::DEFAULT_BATCH_SIZE,
            max_retry: crate::DEFAULT_MAX_RETRY,
            circuit: CircuitConfig::default(),
            retention: RetentionPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl RecoveryConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for zero sizes or delays
    /// and for an invalid breaker configuration.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DeliveryError::configuration("batch_size must be positive"));
        }
        if self.max_retry == 0 {
            return Err(DeliveryError::configuration("max_retry must be positive"));
        }
        if self.fixed_delay.is_zero() {
            return Err(DeliveryError::configuration("fixed_delay must be positive"));
        }
        if self.retention.is_enabled() && self.retention.sweep_interval.is_zero() {
            return Err(DeliveryError::configuration("retention sweep_interval must be positive"));
        }
        self.circuit.validate()
    }
}

/// Runs the recovery scheduler and retention sweeper in the background.
pub struct RecoveryEngine {
    config: RecoveryConfig,
    scheduler: Arc<RecoveryScheduler>,
    sweeper: Arc<RetentionSweeper>,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    task_handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl RecoveryEngine {
    /// Creates an engine. Nothing runs until `start`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the configuration is
    /// invalid.
    pub fn new(
        config: RecoveryConfig,
        store: Arc<dyn DeadLetterStore>,
        publisher: Arc<dyn EventPublishing>,
        lock: Arc<dyn SchedulerLock>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let scheduler = Arc::new(RecoveryScheduler::new(store.clone(), publisher, lock, &config));
        let sweeper =
            Arc::new(RetentionSweeper::new(store, clock.clone(), config.retention.clone()));

        Ok(Self {
            config,
            scheduler,
            sweeper,
            clock,
            cancellation_token: CancellationToken::new(),
            task_handles: Vec::new(),
        })
    }

    /// The scheduler driven by this engine.
    pub fn scheduler(&self) -> Arc<RecoveryScheduler> {
        self.scheduler.clone()
    }

    /// The retention sweeper driven by this engine.
    pub fn sweeper(&self) -> Arc<RetentionSweeper> {
        self.sweeper.clone()
    }

    /// Lifetime scheduler counters.
    pub fn stats(&self) -> RecoveryStats {
        self.scheduler.stats()
    }

    /// Whether background tasks are running.
    pub fn is_running(&self) -> bool {
        self.task_handles.iter().any(|(_, handle)| !handle.is_finished())
    }

    /// Spawns the background tasks and returns immediately.
    ///
    /// The first tick runs right away.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InternalError` if the engine was already
    /// started.
    pub fn start(&mut self) -> Result<()> {
        if !self.task_handles.is_empty() {
            return Err(DeliveryError::internal("recovery engine already started"));
        }

        info!(
            fixed_delay_ms = u64::try_from(self.config.fixed_delay.as_millis()).unwrap_or(u64::MAX),
            batch_size = self.config.batch_size,
            max_retry = self.config.max_retry,
            circuit_threshold = self.config.circuit.threshold,
            "starting dead letter recovery engine"
        );

        let handle = tokio::spawn(run_recovery_loop(
            self.scheduler.clone(),
            self.clock.clone(),
            self.config.fixed_delay,
            self.cancellation_token.clone(),
        ));
        self.task_handles.push(("recovery", handle));

        if self.config.retention.is_enabled() {
            let handle = tokio::spawn(run_retention_loop(
                self.sweeper.clone(),
                self.clock.clone(),
                self.config.retention.sweep_interval,
                self.cancellation_token.clone(),
            ));
            self.task_handles.push(("retention", handle));
        } else {
            info!("recovered dead letter retention disabled");
        }

        Ok(())
    }

    /// Stops the background tasks, waiting for an in-progress tick to finish.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if the tasks do not stop
    /// within the configured shutdown timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        let handles = std::mem::take(&mut self.task_handles);

        if handles.is_empty() {
            info!("recovery engine was not started, shutdown completed immediately");
            return Ok(());
        }

        info!(
            task_count = handles.len(),
            timeout_seconds = timeout.as_secs(),
            "shutting down recovery engine"
        );
        self.cancellation_token.cancel();

        let join_all = async {
            for (task, handle) in handles {
                if let Err(join_error) = handle.await {
                    error!(task, error = %join_error, "recovery task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                info!("recovery engine shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "recovery engine shutdown timed out, a tick may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for RecoveryEngine {
    fn drop(&mut self) {
        if self.task_handles.iter().any(|(_, handle)| !handle.is_finished())
            && !self.cancellation_token.is_cancelled()
        {
            warn!("recovery engine dropped without shutdown, cancelling background tasks");
            self.cancellation_token.cancel();
        }
    }
}

async fn run_recovery_loop(
    scheduler: Arc<RecoveryScheduler>,
    clock: Arc<dyn Clock>,
    fixed_delay: Duration,
    cancellation_token: CancellationToken,
) {
    info!("recovery loop started");

    loop {
        if cancellation_token.is_cancelled() {
            break;
        }

        if let TickOutcome::CircuitOpen { .. } = scheduler.run_tick().await {
            debug!("recovery tick skipped while circuit open");
        }

        tokio::select! {
            () = clock.sleep(fixed_delay) => {}
            () = cancellation_token.cancelled() => break,
        }
    }

    info!("recovery loop stopped");
}

async fn run_retention_loop(
    sweeper: Arc<RetentionSweeper>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = clock.sleep(interval) => {}
            () = cancellation_token.cancelled() => break,
        }

        if let Err(error) = sweeper.sweep().await {
            warn!(error = %error, "retention sweep failed");
        }
    }
}
