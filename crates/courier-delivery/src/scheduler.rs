//! Recovery scheduler: periodic republishing of dead letters.
//!
//! One `run_tick` call is one recovery cycle:
//!
//! 1. If the cycle breaker is open, cool it down by one step and stop.
//! 2. If a previous tick is still running in this process, stop.
//! 3. If another instance holds the recovery lease, stop.
//! 4. Page through retryable dead letters, republishing one page at a time
//!    and recording each outcome in the store.
//! 5. Feed the tick's successes and failures to the breaker.
//!
//! Ticks never return errors. Store and publisher failures are logged and
//! counted as failed events; a failed page fetch ends the tick early.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use courier_core::models::{DeadLetterRecord, EventId};
use tracing::{debug, error, info, warn};

use crate::{
    broker::RecordMetadata,
    circuit::{CircuitState, CycleCircuitBreaker, CycleVerdict},
    engine::RecoveryConfig,
    lock::SchedulerLock,
    publisher::PublishResult,
    service::EventPublishing,
    store::{DeadLetterStore, RecoveryQuery},
};

/// Result of one `run_tick` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Breaker was open; the counter was cooled down and nothing ran.
    CircuitOpen {
        /// Counter after cooling down.
        consecutive_failures: u32,
    },
    /// A previous tick is still running in this process.
    AlreadyRunning,
    /// Another instance holds the recovery lease.
    LockUnavailable,
    /// The tick ran.
    Completed(TickReport),
}

/// Summary of a completed tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Non-empty pages processed.
    pub pages: usize,
    /// Events republished successfully.
    pub successes: u64,
    /// Events whose republish failed.
    pub failures: u64,
    /// Breaker verdict for this tick.
    pub verdict: CycleVerdict,
    /// Breaker counter after this tick.
    pub consecutive_failures: u32,
}

impl TickReport {
    /// Events processed in this tick.
    pub fn processed(&self) -> u64 {
        self.successes + self.failures
    }
}

/// Lifetime counters for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Ticks that ran to completion.
    pub ticks_completed: u64,
    /// Ticks skipped because the breaker was open.
    pub ticks_skipped_circuit_open: u64,
    /// Ticks skipped because a previous tick was still running.
    pub ticks_skipped_running: u64,
    /// Ticks skipped because the lease was held elsewhere.
    pub ticks_skipped_lock: u64,
    /// Dead letters republished successfully.
    pub events_recovered: u64,
    /// Failed republish attempts.
    pub events_failed: u64,
}

/// Clears the running flag when the tick ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Republishes dead letters in bounded pages behind a cycle breaker.
pub struct RecoveryScheduler {
    store: Arc<dyn DeadLetterStore>,
    publisher: Arc<dyn EventPublishing>,
    lock: Arc<dyn SchedulerLock>,
    breaker: CycleCircuitBreaker,
    batch_size: usize,
    max_retry: u32,
    running: AtomicBool,
    batch_success: AtomicU64,
    batch_failure: AtomicU64,
    ticks_completed: AtomicU64,
    ticks_skipped_circuit_open: AtomicU64,
    ticks_skipped_running: AtomicU64,
    ticks_skipped_lock: AtomicU64,
    events_recovered: AtomicU64,
    events_failed: AtomicU64,
}

impl RecoveryScheduler {
    /// Creates a scheduler with a closed breaker.
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        publisher: Arc<dyn EventPublishing>,
        lock: Arc<dyn SchedulerLock>,
        config: &RecoveryConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            lock,
            breaker: CycleCircuitBreaker::new(config.circuit.clone()),
            batch_size: config.batch_size,
            max_retry: config.max_retry,
            running: AtomicBool::new(false),
            batch_success: AtomicU64::new(0),
            batch_failure: AtomicU64::new(0),
            ticks_completed: AtomicU64::new(0),
            ticks_skipped_circuit_open: AtomicU64::new(0),
            ticks_skipped_running: AtomicU64::new(0),
            ticks_skipped_lock: AtomicU64::new(0),
            events_recovered: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
        }
    }

    /// The cycle breaker.
    pub fn breaker(&self) -> &CycleCircuitBreaker {
        &self.breaker
    }

    /// Breaker state.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Consecutive failed ticks.
    pub fn consecutive_failures(&self) -> u32 {
        self.breaker.consecutive_failures()
    }

    /// Whether a tick is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the lifetime counters.
    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            ticks_completed: self.ticks_completed.load(Ordering::Relaxed),
            ticks_skipped_circuit_open: self.ticks_skipped_circuit_open.load(Ordering::Relaxed),
            ticks_skipped_running: self.ticks_skipped_running.load(Ordering::Relaxed),
            ticks_skipped_lock: self.ticks_skipped_lock.load(Ordering::Relaxed),
            events_recovered: self.events_recovered.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
        }
    }

    /// Runs one recovery cycle.
    pub async fn run_tick(&self) -> TickOutcome {
        if self.breaker.is_open() {
            let consecutive_failures = self.breaker.cool_down();
            self.ticks_skipped_circuit_open.fetch_add(1, Ordering::Relaxed);
            warn!(consecutive_failures, "recovery circuit open, skipping tick");
            return TickOutcome::CircuitOpen { consecutive_failures };
        }

        if self.running.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            self.ticks_skipped_running.fetch_add(1, Ordering::Relaxed);
            warn!("previous recovery tick still running, skipping");
            return TickOutcome::AlreadyRunning;
        }
        let _running = RunningGuard(&self.running);

        match self.lock.try_acquire().await {
            Ok(true) => {},
            Ok(false) => {
                self.ticks_skipped_lock.fetch_add(1, Ordering::Relaxed);
                debug!("recovery lease held by another instance, skipping tick");
                return TickOutcome::LockUnavailable;
            },
            Err(error) => {
                self.ticks_skipped_lock.fetch_add(1, Ordering::Relaxed);
                warn!(error = %error, "failed to acquire recovery lease, skipping tick");
                return TickOutcome::LockUnavailable;
            },
        }

        let report = self.process_all_batches().await;

        if let Err(error) = self.lock.release().await {
            warn!(error = %error, "failed to release recovery lease");
        }

        self.ticks_completed.fetch_add(1, Ordering::Relaxed);
        if report.processed() > 0 {
            info!(
                pages = report.pages,
                successes = report.successes,
                failures = report.failures,
                consecutive_failures = report.consecutive_failures,
                "recovery tick completed"
            );
        }
        TickOutcome::Completed(report)
    }

    async fn process_all_batches(&self) -> TickReport {
        self.batch_success.store(0, Ordering::SeqCst);
        self.batch_failure.store(0, Ordering::SeqCst);

        let mut offset = 0;
        let mut pages = 0;
        loop {
            let query = RecoveryQuery::pending(offset, self.batch_size, self.max_retry);
            let page = match self.store.recover_dead_letters(query).await {
                Ok(page) => page,
                Err(error) => {
                    error!(offset, error = %error, "failed to fetch dead letters, ending tick");
                    break;
                },
            };
            if page.is_empty() {
                break;
            }

            let page_len = page.len();
            pages += 1;
            self.process_page(page).await;
            debug!(
                offset,
                page_len,
                successes = self.batch_success.load(Ordering::SeqCst),
                failures = self.batch_failure.load(Ordering::SeqCst),
                "recovery page processed"
            );

            if page_len < self.batch_size {
                break;
            }
            offset += self.batch_size;
        }

        let successes = self.batch_success.load(Ordering::SeqCst);
        let failures = self.batch_failure.load(Ordering::SeqCst);
        let verdict = self.breaker.record_cycle(successes, failures);

        TickReport {
            pages,
            successes,
            failures,
            verdict,
            consecutive_failures: self.breaker.consecutive_failures(),
        }
    }

    async fn process_page(&self, page: Vec<DeadLetterRecord>) {
        let event_ids: Vec<EventId> = page.iter().map(|record| record.event_id().clone()).collect();
        let events = page.iter().map(DeadLetterRecord::to_outbound).collect();

        match self.publisher.publish_batch(events).await {
            Ok(results) => {
                for event_id in event_ids {
                    match results.get(&event_id).and_then(PublishResult::metadata) {
                        Some(metadata) => self.record_success(event_id, metadata).await,
                        None => self.record_failure(event_id).await,
                    }
                }
            },
            Err(error) => {
                warn!(
                    page_len = event_ids.len(),
                    error = %error,
                    "batch republish failed, counting every event in the page as failed"
                );
                for event_id in event_ids {
                    self.record_failure(event_id).await;
                }
            },
        }
    }

    async fn record_success(&self, event_id: EventId, metadata: RecordMetadata) {
        self.batch_success.fetch_add(1, Ordering::SeqCst);
        self.events_recovered.fetch_add(1, Ordering::Relaxed);

        if let Err(error) =
            self.store.mark_recovered(event_id.clone(), metadata.partition, metadata.offset).await
        {
            error!(
                event_id = %event_id,
                partition = metadata.partition,
                offset = metadata.offset,
                error = %error,
                "republished dead letter could not be marked recovered"
            );
        }
    }

    async fn record_failure(&self, event_id: EventId) {
        self.batch_failure.fetch_add(1, Ordering::SeqCst);
        self.events_failed.fetch_add(1, Ordering::Relaxed);

        if let Err(error) = self.store.handle_retry_failure(event_id.clone()).await {
            error!(
                event_id = %event_id,
                error = %error,
                "failed to record dead letter retry failure"
            );
        }
    }
}
