//! End-to-end flow: a publish fails, is dead-lettered, and is recovered in
//! the background once the broker comes back.
//!
//! Components are assembled from `Config` the way the binary does, with the
//! in-memory store and mock broker standing in for PostgreSQL and Kafka.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{sync::Arc, time::Duration};

use courier::Config;
use courier_core::{
    models::{DeadLetterStatus, EventEnvelope, OutboundEvent},
    Clock, EventId, RealClock,
};
use courier_delivery::{
    broker::mock::MockBrokerClient, lock::LocalLock, store::memory::InMemoryDeadLetterStore,
    BrokerError, BrokerErrorKind, EventPublishing, PublishService, Publisher, RecoveryEngine,
};

fn fast_config() -> Config {
    let mut config = Config::default();
    config.recovery_fixed_delay_ms = 20;
    config.recovery_batch_size = 5;
    config.recovered_retention_days = 0;
    config.shutdown_timeout_seconds = 2;
    config
}

struct Pipeline {
    clock: Arc<dyn Clock>,
    store: InMemoryDeadLetterStore,
    broker: MockBrokerClient,
    service: Arc<PublishService>,
}

fn pipeline(config: &Config) -> Pipeline {
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let store = InMemoryDeadLetterStore::new(clock.clone(), config.recovery_max_retry);
    let broker = MockBrokerClient::new();
    let service = PublishService::new(
        Publisher::new(Arc::new(broker.clone())),
        config.to_classifier(),
        Arc::new(store.clone()),
        clock.clone(),
    )
    .with_publish_timeout(config.publish_timeout());

    Pipeline { clock, store, broker, service: Arc::new(service) }
}

fn origin(clock: &dyn Clock, id: &str) -> OutboundEvent {
    let value = r#"{"amount":42}"#;
    let envelope = EventEnvelope::new("payment-settled", "acct-19", value, "t-1", clock.now_utc())
        .with_event_id(id);
    OutboundEvent::Origin(envelope)
}

async fn wait_for_status(store: &InMemoryDeadLetterStore, id: &str, status: DeadLetterStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let current = store.get(&EventId::from(id)).await.map(|record| record.status());
        if current == Some(status) {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "{id} never reached {status}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn failed_publish_is_recovered_after_broker_heals() {
    let config = fast_config();
    let Pipeline { clock, store, broker, service } = pipeline(&config);

    broker.fail_all(Some(BrokerError::connection("all brokers down")));
    let delivered = service.publish_event(origin(clock.as_ref(), "evt-pay-1")).await.unwrap();
    assert!(!delivered);

    let record = store.get(&EventId::from("evt-pay-1")).await.expect("dead letter saved");
    assert!(record.is_retryable());
    assert_eq!(record.status(), DeadLetterStatus::Dead);

    broker.heal();
    let mut engine = RecoveryEngine::new(
        config.to_recovery_config(),
        Arc::new(store.clone()),
        service,
        Arc::new(LocalLock),
        clock,
    )
    .unwrap();
    engine.start().unwrap();

    wait_for_status(&store, "evt-pay-1", DeadLetterStatus::Recovered).await;
    engine.shutdown().await.unwrap();

    let record = store.get(&EventId::from("evt-pay-1")).await.unwrap();
    assert!(record.recovered_partition().is_some());
}

#[tokio::test]
async fn permanent_failures_are_never_republished() {
    let config = fast_config();
    let Pipeline { clock, store, broker, service } = pipeline(&config);

    broker.fail_all(Some(BrokerError::new(BrokerErrorKind::Authorization, "denied")));
    assert!(!service.publish_event(origin(clock.as_ref(), "evt-denied")).await.unwrap());
    broker.heal();

    let mut engine = RecoveryEngine::new(
        config.to_recovery_config(),
        Arc::new(store.clone()),
        service,
        Arc::new(LocalLock),
        clock,
    )
    .unwrap();
    let scheduler = engine.scheduler();
    engine.start().unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while scheduler.stats().ticks_completed < 3 {
        assert!(tokio::time::Instant::now() < deadline, "scheduler stalled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    engine.shutdown().await.unwrap();

    let record = store.get(&EventId::from("evt-denied")).await.unwrap();
    assert!(!record.is_retryable());
    assert_eq!(record.status(), DeadLetterStatus::Dead);
    assert_eq!(broker.send_count(), 1);
}

#[tokio::test]
async fn configured_classification_controls_retryability() {
    let mut config = fast_config();
    config.retryable_errors = vec![BrokerErrorKind::RecordTooLarge];
    config.non_retryable_errors = vec![BrokerErrorKind::Connection];
    let Pipeline { clock, store, broker, service } = pipeline(&config);

    broker.fail_all(Some(BrokerError::connection("refused")));
    service.publish_event(origin(clock.as_ref(), "evt-conn")).await.unwrap();
    broker.fail_all(Some(BrokerError::new(BrokerErrorKind::RecordTooLarge, "too large")));
    service.publish_event(origin(clock.as_ref(), "evt-large")).await.unwrap();

    assert!(!store.get(&EventId::from("evt-conn")).await.unwrap().is_retryable());
    assert!(store.get(&EventId::from("evt-large")).await.unwrap().is_retryable());
}
