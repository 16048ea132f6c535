//! Tests for the recovery scheduler tick.
//!
//! Drives `RecoveryScheduler::run_tick` against the in-memory dead-letter
//! store and the scripted broker, checking the breaker, single-flight guard,
//! pagination and per-event bookkeeping.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use courier_core::{
    error::{CoreError, Result as CoreResult},
    models::{
        DeadLetterRecord, DeadLetterStatus, EventEnvelope, EventId, FailureContext, OutboundEvent,
    },
    time::TestClock,
};
use courier_delivery::{
    broker::mock::MockBrokerClient,
    circuit::{CircuitConfig, CircuitState, CycleVerdict},
    lock::{LocalLock, SchedulerLock},
    store::memory::InMemoryDeadLetterStore,
    BrokerError, DeliveryError, EventPublishing, FailureClassifier, PublishResult,
    PublishService, Publisher, RecoveryConfig, RecoveryScheduler, TickOutcome, TickReport,
};
use tokio::sync::Notify;

const MAX_RETRY: u32 = 5;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
}

fn event_id(index: usize) -> EventId {
    EventId::from(format!("evt-{index:03}"))
}

fn dead_letter(index: usize) -> DeadLetterRecord {
    let envelope = EventEnvelope::new(
        "appointment-booked",
        format!("customer-{index}"),
        r#"{"slot":"09:00"}"#,
        format!("trace-{index}"),
        base_time(),
    )
    .with_event_id(event_id(index));

    let created_at = base_time() + Duration::seconds(i64::try_from(index).unwrap());
    DeadLetterRecord::create(
        &envelope,
        FailureContext::new("connection refused", "connection"),
        true,
        created_at,
    )
    .unwrap()
}

fn config(batch_size: usize) -> RecoveryConfig {
    RecoveryConfig { batch_size, max_retry: MAX_RETRY, ..RecoveryConfig::default() }
}

struct Harness {
    store: InMemoryDeadLetterStore,
    broker: MockBrokerClient,
    scheduler: Arc<RecoveryScheduler>,
}

impl Harness {
    fn new(batch_size: usize) -> Self {
        Self::with_lock(batch_size, Arc::new(LocalLock))
    }

    fn with_lock(batch_size: usize, lock: Arc<dyn SchedulerLock>) -> Self {
        let clock = Arc::new(TestClock::at(base_time() + Duration::hours(1)));
        let store = InMemoryDeadLetterStore::new(clock.clone(), MAX_RETRY);
        let broker = MockBrokerClient::new();
        let service = PublishService::new(
            Publisher::new(Arc::new(broker.clone())),
            FailureClassifier::default(),
            Arc::new(store.clone()),
            clock,
        );
        let scheduler = Arc::new(RecoveryScheduler::new(
            Arc::new(store.clone()),
            Arc::new(service),
            lock,
            &config(batch_size),
        ));
        Self { store, broker, scheduler }
    }

    async fn seed(&self, count: usize) {
        for index in 0..count {
            self.store.insert(dead_letter(index)).await;
        }
    }
}

fn completed(outcome: TickOutcome) -> TickReport {
    match outcome {
        TickOutcome::Completed(report) => report,
        other => panic!("expected a completed tick, got {other:?}"),
    }
}

/// Publisher double whose batch call fails as a whole.
struct AbortingPublisher {
    calls: AtomicUsize,
}

impl EventPublishing for AbortingPublisher {
    fn publish_event(
        &self,
        _event: OutboundEvent,
    ) -> Pin<Box<dyn Future<Output = courier_delivery::Result<bool>> + Send + '_>> {
        Box::pin(async { Ok(false) })
    }

    fn publish_batch(
        &self,
        _events: Vec<OutboundEvent>,
    ) -> Pin<
        Box<
            dyn Future<Output = courier_delivery::Result<HashMap<EventId, PublishResult>>>
                + Send
                + '_,
        >,
    > {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DeliveryError::batch_aborted("broker outage"))
        })
    }
}

/// Publisher double that holds the batch call until released.
struct GatedPublisher {
    entered: Notify,
    release: Notify,
    calls: AtomicUsize,
}

impl EventPublishing for GatedPublisher {
    fn publish_event(
        &self,
        _event: OutboundEvent,
    ) -> Pin<Box<dyn Future<Output = courier_delivery::Result<bool>> + Send + '_>> {
        Box::pin(async { Ok(false) })
    }

    fn publish_batch(
        &self,
        _events: Vec<OutboundEvent>,
    ) -> Pin<
        Box<
            dyn Future<Output = courier_delivery::Result<HashMap<EventId, PublishResult>>>
                + Send
                + '_,
        >,
    > {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(HashMap::new())
        })
    }
}

/// Lock double with a fixed answer that counts calls.
struct ScriptedLock {
    grant: CoreResult<bool>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl ScriptedLock {
    fn new(grant: CoreResult<bool>) -> Self {
        Self { grant, acquired: AtomicUsize::new(0), released: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl SchedulerLock for ScriptedLock {
    async fn try_acquire(&self) -> CoreResult<bool> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.grant.clone()
    }

    async fn release(&self) -> CoreResult<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn successful_tick_recovers_every_dead_letter() {
    let harness = Harness::new(50);
    harness.seed(3).await;

    let report = completed(harness.scheduler.run_tick().await);

    assert_eq!(report.pages, 1);
    assert_eq!(report.successes, 3);
    assert_eq!(report.failures, 0);
    assert_eq!(report.verdict, CycleVerdict::Healthy);
    for record in harness.store.records().await {
        assert_eq!(record.status(), DeadLetterStatus::Recovered);
        assert!(!record.is_retryable());
        assert!(record.recovered_offset().is_some());
    }
    assert_eq!(harness.scheduler.stats().events_recovered, 3);
}

#[tokio::test]
async fn empty_store_leaves_breaker_untouched() {
    let harness = Harness::new(50);

    let report = completed(harness.scheduler.run_tick().await);

    assert_eq!(report.pages, 0);
    assert_eq!(report.verdict, CycleVerdict::Idle);
    assert_eq!(harness.scheduler.consecutive_failures(), 0);
    assert_eq!(harness.broker.send_count(), 0);
}

#[tokio::test]
async fn failed_retry_is_counted_once_per_tick() {
    let harness = Harness::new(50);
    harness.seed(2).await;
    harness.broker.fail_all(Some(BrokerError::connection("broker down")));

    completed(harness.scheduler.run_tick().await);

    for record in harness.store.records().await {
        assert_eq!(record.retry_count(), 1);
        assert_eq!(record.status(), DeadLetterStatus::Dead);
        assert!(record.is_retryable());
        assert!(record.next_retry_at().is_some());
    }
}

#[tokio::test]
async fn breaker_opens_after_three_failed_ticks_then_cools_down() {
    let harness = Harness::new(50);
    harness.seed(5).await;
    harness.broker.fail_all(Some(BrokerError::connection("broker down")));

    let first = completed(harness.scheduler.run_tick().await);
    assert_eq!(first.verdict, CycleVerdict::Degraded { consecutive_failures: 1 });
    let second = completed(harness.scheduler.run_tick().await);
    assert_eq!(second.verdict, CycleVerdict::Degraded { consecutive_failures: 2 });
    let third = completed(harness.scheduler.run_tick().await);
    assert_eq!(third.verdict, CycleVerdict::Opened { consecutive_failures: 3 });
    assert_eq!(harness.scheduler.circuit_state(), CircuitState::Open);

    let operations = harness.store.operation_count();
    let sends = harness.broker.send_count();

    let outcome = harness.scheduler.run_tick().await;

    assert_eq!(outcome, TickOutcome::CircuitOpen { consecutive_failures: 2 });
    assert_eq!(harness.store.operation_count(), operations);
    assert_eq!(harness.broker.send_count(), sends);
    assert_eq!(harness.scheduler.circuit_state(), CircuitState::HalfOpen);
    assert_eq!(harness.scheduler.stats().ticks_skipped_circuit_open, 1);
}

#[tokio::test]
async fn any_success_closes_breaker_immediately() {
    let harness = Harness::new(50);
    harness.seed(5).await;
    harness.broker.fail_all(Some(BrokerError::connection("broker down")));
    for _ in 0..3 {
        completed(harness.scheduler.run_tick().await);
    }
    assert!(matches!(
        harness.scheduler.run_tick().await,
        TickOutcome::CircuitOpen { consecutive_failures: 2 }
    ));

    harness.broker.heal();
    let report = completed(harness.scheduler.run_tick().await);

    assert_eq!(report.verdict, CycleVerdict::Healthy);
    assert_eq!(report.consecutive_failures, 0);
    assert_eq!(harness.scheduler.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn mixed_pages_above_failure_rate_increment_breaker_once() {
    let harness = Harness::new(50);
    harness.seed(120).await;
    for index in 0..100 {
        harness.broker.fail_event(event_id(index), BrokerError::timeout("no ack"));
    }

    let report = completed(harness.scheduler.run_tick().await);

    assert_eq!(report.pages, 3);
    assert_eq!(report.successes, 20);
    assert_eq!(report.failures, 100);
    assert_eq!(report.verdict, CycleVerdict::Degraded { consecutive_failures: 1 });
    assert_eq!(harness.scheduler.consecutive_failures(), 1);
    assert_eq!(harness.broker.send_count(), 120);
}

#[tokio::test]
async fn short_page_ends_the_tick() {
    let harness = Harness::new(50);
    harness.seed(20).await;
    harness.broker.fail_all(Some(BrokerError::connection("broker down")));

    let report = completed(harness.scheduler.run_tick().await);

    assert_eq!(report.pages, 1);
    assert_eq!(report.processed(), 20);
    // one fetch plus one retry failure per event
    assert_eq!(harness.store.operation_count(), 21);
}

#[tokio::test]
async fn records_recovered_mid_tick_shift_later_pages_to_next_tick() {
    let harness = Harness::new(10);
    harness.seed(15).await;

    let first = completed(harness.scheduler.run_tick().await);
    assert_eq!(first.pages, 1);
    assert_eq!(first.successes, 10);

    let second = completed(harness.scheduler.run_tick().await);
    assert_eq!(second.successes, 5);

    let recovered = harness
        .store
        .records()
        .await
        .iter()
        .filter(|record| record.status() == DeadLetterStatus::Recovered)
        .count();
    assert_eq!(recovered, 15);
}

#[tokio::test]
async fn aborted_batch_fails_every_event_in_the_page() {
    let clock = Arc::new(TestClock::at(base_time() + Duration::hours(1)));
    let store = InMemoryDeadLetterStore::new(clock, MAX_RETRY);
    for index in 0..10 {
        store.insert(dead_letter(index)).await;
    }
    let publisher = Arc::new(AbortingPublisher { calls: AtomicUsize::new(0) });
    let scheduler = RecoveryScheduler::new(
        Arc::new(store.clone()),
        publisher.clone(),
        Arc::new(LocalLock),
        &config(50),
    );

    let report = completed(scheduler.run_tick().await);

    assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.successes, 0);
    assert_eq!(report.failures, 10);
    for record in store.records().await {
        assert_eq!(record.status(), DeadLetterStatus::Dead);
        assert_eq!(record.retry_count(), 1);
        assert!(record.recovered_partition().is_none());
    }
}

#[tokio::test]
async fn overlapping_tick_returns_without_io() {
    let clock = Arc::new(TestClock::at(base_time() + Duration::hours(1)));
    let store = InMemoryDeadLetterStore::new(clock, MAX_RETRY);
    store.insert(dead_letter(0)).await;
    let publisher = Arc::new(GatedPublisher {
        entered: Notify::new(),
        release: Notify::new(),
        calls: AtomicUsize::new(0),
    });
    let scheduler = Arc::new(RecoveryScheduler::new(
        Arc::new(store.clone()),
        publisher.clone(),
        Arc::new(LocalLock),
        &config(50),
    ));

    let running = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run_tick().await }
    });
    publisher.entered.notified().await;
    assert!(scheduler.is_running());

    let operations = store.operation_count();
    let outcome = scheduler.run_tick().await;

    assert_eq!(outcome, TickOutcome::AlreadyRunning);
    assert_eq!(store.operation_count(), operations);
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);

    publisher.release.notify_one();
    let first = running.await.unwrap();
    assert!(matches!(first, TickOutcome::Completed(_)));
    assert!(!scheduler.is_running());
    assert_eq!(scheduler.stats().ticks_skipped_running, 1);
}

#[tokio::test]
async fn unavailable_lease_skips_tick_without_io() {
    let lock = Arc::new(ScriptedLock::new(Ok(false)));
    let harness = Harness::with_lock(50, lock.clone());
    harness.seed(3).await;

    let outcome = harness.scheduler.run_tick().await;

    assert_eq!(outcome, TickOutcome::LockUnavailable);
    assert_eq!(harness.store.operation_count(), 0);
    assert_eq!(harness.broker.send_count(), 0);
    assert_eq!(lock.released.load(Ordering::SeqCst), 0);
    assert!(!harness.scheduler.is_running());
}

#[tokio::test]
async fn lease_errors_skip_tick() {
    let lock = Arc::new(ScriptedLock::new(Err(CoreError::Database("lease table missing".into()))));
    let harness = Harness::with_lock(50, lock);
    harness.seed(1).await;

    assert_eq!(harness.scheduler.run_tick().await, TickOutcome::LockUnavailable);
    assert_eq!(harness.broker.send_count(), 0);
    assert_eq!(harness.scheduler.stats().ticks_skipped_lock, 1);
}

#[tokio::test]
async fn lease_is_released_after_tick() {
    let lock = Arc::new(ScriptedLock::new(Ok(true)));
    let harness = Harness::with_lock(50, lock.clone());
    harness.seed(2).await;

    completed(harness.scheduler.run_tick().await);

    assert_eq!(lock.acquired.load(Ordering::SeqCst), 1);
    assert_eq!(lock.released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fetch_failure_ends_tick_without_touching_breaker() {
    let harness = Harness::new(50);
    harness.seed(4).await;
    harness.store.inject_fetch_error("connection reset").await;

    let report = completed(harness.scheduler.run_tick().await);

    assert_eq!(report.pages, 0);
    assert_eq!(report.verdict, CycleVerdict::Idle);
    assert_eq!(harness.broker.send_count(), 0);

    let report = completed(harness.scheduler.run_tick().await);
    assert_eq!(report.successes, 4);
}

#[tokio::test]
async fn exhausted_dead_letters_stop_being_fetched() {
    let harness = Harness::new(50);
    harness.seed(1).await;
    harness.broker.fail_all(Some(BrokerError::connection("broker down")));

    for _ in 0..MAX_RETRY {
        completed(harness.scheduler.run_tick().await);
        harness.scheduler.breaker().reset();
    }

    let record = harness.store.get(&event_id(0)).await.unwrap();
    assert_eq!(record.retry_count(), MAX_RETRY);
    assert!(!record.is_retryable());

    let sends = harness.broker.send_count();
    let report = completed(harness.scheduler.run_tick().await);
    assert_eq!(report.pages, 0);
    assert_eq!(harness.broker.send_count(), sends);
}

#[tokio::test]
async fn lenient_failure_rate_keeps_breaker_closed() {
    let clock = Arc::new(TestClock::at(base_time() + Duration::hours(1)));
    let store = InMemoryDeadLetterStore::new(clock.clone(), MAX_RETRY);
    for index in 0..5 {
        store.insert(dead_letter(index)).await;
    }
    let broker = MockBrokerClient::new();
    for index in 0..4 {
        broker.fail_event(event_id(index), BrokerError::timeout("no ack"));
    }
    let service = PublishService::new(
        Publisher::new(Arc::new(broker)),
        FailureClassifier::default(),
        Arc::new(store.clone()),
        clock,
    );
    let config = RecoveryConfig {
        circuit: CircuitConfig { threshold: 3, failure_rate_threshold: 0.9 },
        ..config(50)
    };
    let scheduler =
        RecoveryScheduler::new(Arc::new(store), Arc::new(service), Arc::new(LocalLock), &config);

    let report = completed(scheduler.run_tick().await);

    assert_eq!(report.failures, 4);
    assert_eq!(report.verdict, CycleVerdict::Healthy);
    assert_eq!(scheduler.consecutive_failures(), 0);
}
