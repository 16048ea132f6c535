//! Tests for the recovered dead-letter retention sweep.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use courier_core::{
    models::{DeadLetterRecord, EventEnvelope, FailureContext},
    time::TestClock,
    EventId,
};
use courier_delivery::{
    retention::{RetentionPolicy, RetentionSweeper},
    store::memory::InMemoryDeadLetterStore,
    DeliveryError,
};

fn day(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, day, 12, 0, 0).unwrap()
}

fn recovered(id: &str, created_at: DateTime<Utc>) -> DeadLetterRecord {
    let envelope =
        EventEnvelope::new("otp-issued", "user-3", "{}", "trace", created_at).with_event_id(id);
    let failure = FailureContext::new("timeout", "timeout");
    let mut record = DeadLetterRecord::create(&envelope, failure, true, created_at).unwrap();
    assert!(record.mark_recovered(0, 1));
    record
}

fn sweeper(policy: RetentionPolicy) -> (RetentionSweeper, InMemoryDeadLetterStore) {
    let clock = Arc::new(TestClock::at(day(30)));
    let store = InMemoryDeadLetterStore::new(clock.clone(), 5);
    (RetentionSweeper::new(Arc::new(store.clone()), clock, policy), store)
}

#[tokio::test]
async fn sweep_deletes_recovered_records_past_retention() {
    let (sweeper, store) = sweeper(RetentionPolicy::days(7));
    store.insert(recovered("evt-old", day(1))).await;
    store.insert(recovered("evt-recent", day(25))).await;

    assert_eq!(sweeper.sweep().await.unwrap(), 1);
    assert!(store.get(&EventId::from("evt-old")).await.is_none());
    assert!(store.get(&EventId::from("evt-recent")).await.is_some());
}

#[tokio::test]
async fn disabled_policy_never_touches_the_store() {
    let (sweeper, store) = sweeper(RetentionPolicy::disabled());
    store.insert(recovered("evt-old", day(1))).await;

    assert_eq!(sweeper.sweep().await.unwrap(), 0);
    assert_eq!(store.operation_count(), 0);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn oversized_retention_deletes_nothing() {
    let policy = RetentionPolicy { recovered_ttl: Duration::MAX, ..RetentionPolicy::default() };
    let (sweeper, store) = sweeper(policy);
    store.insert(recovered("evt-old", day(1))).await;

    assert_eq!(sweeper.sweep().await.unwrap(), 0);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn purge_failures_surface_as_storage_errors() {
    let (sweeper, store) = sweeper(RetentionPolicy::days(1));
    store.inject_update_error("relation does not exist").await;

    assert!(matches!(sweeper.sweep().await, Err(DeliveryError::Storage { .. })));
}

#[test]
fn default_policy_keeps_thirty_days() {
    let policy = RetentionPolicy::default();
    assert!(policy.is_enabled());
    assert_eq!(policy.recovered_ttl, Duration::from_secs(30 * 24 * 60 * 60));
    assert_eq!(policy.sweep_interval, Duration::from_secs(60 * 60));
}
