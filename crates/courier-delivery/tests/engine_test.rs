//! Lifecycle tests for the recovery engine.
//!
//! These run on the real clock with short delays, so each test finishes in
//! well under a second.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use courier_core::{
    models::{DeadLetterRecord, DeadLetterStatus, EventEnvelope, FailureContext},
    time::RealClock,
    Clock, EventId,
};
use courier_delivery::{
    broker::mock::MockBrokerClient, lock::LocalLock, retention::RetentionPolicy,
    store::memory::InMemoryDeadLetterStore, BrokerError, DeliveryError, FailureClassifier,
    PublishService, Publisher, RecoveryConfig, RecoveryEngine,
};

const MAX_RETRY: u32 = 5;

fn dead_letter(id: &str) -> DeadLetterRecord {
    let created_at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
    let envelope = EventEnvelope::new("order-placed", "order-77", "{}", "trace-9", created_at)
        .with_event_id(id);
    DeadLetterRecord::create(
        &envelope,
        FailureContext::new("all brokers down", "connection"),
        true,
        created_at,
    )
    .unwrap()
}

fn fast_config(retention: RetentionPolicy) -> RecoveryConfig {
    RecoveryConfig {
        fixed_delay: Duration::from_millis(20),
        batch_size: 10,
        max_retry: MAX_RETRY,
        retention,
        shutdown_timeout: Duration::from_secs(2),
        ..RecoveryConfig::default()
    }
}

fn engine(config: RecoveryConfig) -> (RecoveryEngine, InMemoryDeadLetterStore, MockBrokerClient) {
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let store = InMemoryDeadLetterStore::new(clock.clone(), config.max_retry);
    let broker = MockBrokerClient::new();
    let service = PublishService::new(
        Publisher::new(Arc::new(broker.clone())),
        FailureClassifier::default(),
        Arc::new(store.clone()),
        clock.clone(),
    );
    let engine = RecoveryEngine::new(
        config,
        Arc::new(store.clone()),
        Arc::new(service),
        Arc::new(LocalLock),
        clock,
    )
    .unwrap();
    (engine, store, broker)
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 2s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn engine_recovers_dead_letters_in_background() {
    let (mut engine, store, _broker) = engine(fast_config(RetentionPolicy::disabled()));
    for id in ["evt-1", "evt-2", "evt-3"] {
        store.insert(dead_letter(id)).await;
    }

    engine.start().unwrap();
    assert!(engine.is_running());

    wait_until(|| {
        let store = store.clone();
        async move {
            let records = store.records().await;
            records.iter().all(|record| record.status() == DeadLetterStatus::Recovered)
        }
    })
    .await;

    assert!(engine.stats().events_recovered >= 3);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn engine_keeps_retrying_until_broker_heals() {
    let config = RecoveryConfig { max_retry: 1_000, ..fast_config(RetentionPolicy::disabled()) };
    let (mut engine, store, broker) = engine(config);
    store.insert(dead_letter("evt-1")).await;
    broker.fail_all(Some(BrokerError::connection("broker down")));

    engine.start().unwrap();
    wait_until(|| {
        let store = store.clone();
        async move { store.get(&EventId::from("evt-1")).await.unwrap().retry_count() >= 1 }
    })
    .await;

    broker.heal();
    wait_until(|| {
        let store = store.clone();
        async move {
            store.get(&EventId::from("evt-1")).await.unwrap().status()
                == DeadLetterStatus::Recovered
        }
    })
    .await;

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn retention_task_purges_expired_recovered_records() {
    let retention = RetentionPolicy {
        recovered_ttl: Duration::from_secs(60),
        sweep_interval: Duration::from_millis(20),
    };
    let (mut engine, store, _broker) = engine(fast_config(retention));
    let mut recovered = dead_letter("evt-old");
    assert!(recovered.mark_recovered(1, 10));
    store.insert(recovered).await;
    let mut permanent = dead_letter("evt-dead");
    permanent.mark_failed();
    store.insert(permanent).await;

    engine.start().unwrap();
    wait_until(|| {
        let store = store.clone();
        async move { store.get(&EventId::from("evt-old")).await.is_none() }
    })
    .await;

    assert!(store.get(&EventId::from("evt-dead")).await.is_some());
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn starting_twice_is_rejected() {
    let (mut engine, _store, _broker) = engine(fast_config(RetentionPolicy::disabled()));

    engine.start().unwrap();
    assert!(matches!(engine.start(), Err(DeliveryError::InternalError { .. })));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_without_start_completes_immediately() {
    let (engine, _store, _broker) = engine(fast_config(RetentionPolicy::disabled()));
    assert!(!engine.is_running());
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_stops_ticking() {
    let (mut engine, _store, _broker) = engine(fast_config(RetentionPolicy::disabled()));
    let scheduler = engine.scheduler();

    engine.start().unwrap();
    wait_until(|| {
        let scheduler = scheduler.clone();
        async move { scheduler.stats().ticks_completed >= 2 }
    })
    .await;
    engine.shutdown().await.unwrap();

    let ticks = scheduler.stats().ticks_completed;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.stats().ticks_completed, ticks);
}

#[tokio::test]
async fn invalid_config_is_rejected_on_construction() {
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let store = InMemoryDeadLetterStore::new(clock.clone(), MAX_RETRY);
    let service = PublishService::new(
        Publisher::new(Arc::new(MockBrokerClient::new())),
        FailureClassifier::default(),
        Arc::new(store.clone()),
        clock.clone(),
    );

    let result = RecoveryEngine::new(
        RecoveryConfig { batch_size: 0, ..RecoveryConfig::default() },
        Arc::new(store),
        Arc::new(service),
        Arc::new(LocalLock),
        clock,
    );

    assert!(matches!(result, Err(DeliveryError::ConfigurationError { .. })));
}
