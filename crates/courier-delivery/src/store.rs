//! Dead-letter store abstraction.
//!
//! The publishing and recovery pipeline only talks to `DeadLetterStore`.
//! Production wires `PostgresDeadLetterStore` over the core repositories;
//! tests use `memory::InMemoryDeadLetterStore`, which supports one-shot error
//! injection and counts every operation.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result,
    models::{DeadLetterRecord, DeadLetterStatus, EventId},
    storage::Storage,
    Clock,
};
use tracing::{debug, info, warn};

use crate::backoff;

/// Filter for the recovery fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryQuery {
    /// Required `retryable` flag.
    pub retryable: bool,
    /// Required status.
    pub status: DeadLetterStatus,
    /// Rows to skip.
    pub offset: usize,
    /// Maximum rows to return.
    pub limit: usize,
    /// Records at or above this retry count are excluded.
    pub max_retry: u32,
}

impl RecoveryQuery {
    /// Retryable dead records, one page at `offset`.
    pub fn pending(offset: usize, limit: usize, max_retry: u32) -> Self {
        Self { retryable: true, status: DeadLetterStatus::Dead, offset, limit, max_retry }
    }
}

/// What `handle_retry_failure` did to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryFailureOutcome {
    /// Counted; the record stays eligible for recovery.
    Rescheduled {
        /// Retry count after this failure.
        retry_count: u32,
        /// Informational time of the next attempt.
        next_retry_at: Option<DateTime<Utc>>,
    },
    /// Counted; the record is now permanently dead.
    Exhausted {
        /// Retry count after this failure.
        retry_count: u32,
    },
    /// The record was already recovered; nothing changed.
    AlreadyRecovered,
    /// No record with that id.
    NotFound,
}

/// Durable dead-letter operations used by publishing and recovery.
pub trait DeadLetterStore: Send + Sync + 'static {
    /// Inserts or replaces the record with the same event id.
    fn save(
        &self,
        record: DeadLetterRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Finds one record.
    fn find_by_id(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeadLetterRecord>>> + Send + '_>>;

    /// Pages through records with the given status, oldest first.
    fn find_by_status(
        &self,
        status: DeadLetterStatus,
        offset: usize,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterRecord>>> + Send + '_>>;

    /// Fetches one page of records matching `query`.
    ///
    /// Pages are ordered by `(created_at, event_id)` ascending.
    fn recover_dead_letters(
        &self,
        query: RecoveryQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterRecord>>> + Send + '_>>;

    /// Marks a record recovered at the position of the successful republish.
    ///
    /// Idempotent: returns `Ok(false)` when the record is already recovered
    /// or does not exist.
    fn mark_recovered(
        &self,
        event_id: EventId,
        partition: i32,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Records one failed recovery attempt.
    ///
    /// Single-row read-modify-write: concurrent calls for the same event never
    /// lose an increment.
    fn handle_retry_failure(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<RetryFailureOutcome>> + Send + '_>>;

    /// Deletes recovered records created before `cutoff`.
    fn purge_recovered_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;
}

/// Applies one failed retry to `record`.
///
/// Increments the count whenever it is below the cap, whatever the retryable
/// flag. A record that is then at the cap or not retryable is made
/// permanently dead; otherwise the informational next retry time is stamped.
/// Records already at the cap are made permanently dead without counting.
///
/// # Errors
///
/// Returns error if the record rejects the increment.
pub fn apply_retry_failure(
    record: &mut DeadLetterRecord,
    max_retry: u32,
    now: DateTime<Utc>,
) -> Result<RetryFailureOutcome> {
    if record.status() == DeadLetterStatus::Recovered {
        return Ok(RetryFailureOutcome::AlreadyRecovered);
    }
    if record.retry_count() >= max_retry {
        record.mark_failed();
        return Ok(RetryFailureOutcome::Exhausted { retry_count: record.retry_count() });
    }

    let retry_count = record.increment_retry(max_retry)?;
    if !record.can_retry(max_retry) {
        record.mark_failed();
        return Ok(RetryFailureOutcome::Exhausted { retry_count });
    }

    let at = backoff::next_retry_at(retry_count, now);
    if let Err(error) = record.schedule_next_retry(at, now) {
        debug!(event_id = %record.event_id(), error = %error, "next retry time not stamped");
    }
    Ok(RetryFailureOutcome::Rescheduled { retry_count, next_retry_at: record.next_retry_at() })
}

fn log_retry_failure(event_id: &EventId, outcome: RetryFailureOutcome) {
    match outcome {
        RetryFailureOutcome::Rescheduled { retry_count, next_retry_at } => {
            debug!(event_id = %event_id, retry_count, ?next_retry_at, "dead letter retry failed");
        },
        RetryFailureOutcome::Exhausted { retry_count } => {
            warn!(event_id = %event_id, retry_count, "dead letter exhausted its retries");
        },
        RetryFailureOutcome::AlreadyRecovered => {
            debug!(event_id = %event_id, "retry failure ignored for recovered dead letter");
        },
        RetryFailureOutcome::NotFound => {
            warn!(event_id = %event_id, "dead letter not found while recording retry failure");
        },
    }
}

/// PostgreSQL dead-letter store.
pub struct PostgresDeadLetterStore {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
    max_retry: u32,
}

impl PostgresDeadLetterStore {
    /// Creates a store over the core repositories.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>, max_retry: u32) -> Self {
        Self { storage, clock, max_retry }
    }
}

impl DeadLetterStore for PostgresDeadLetterStore {
    fn save(
        &self,
        record: DeadLetterRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.storage.dead_letters.upsert(&record).await })
    }

    fn find_by_id(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeadLetterRecord>>> + Send + '_>> {
        Box::pin(async move { self.storage.dead_letters.find_by_id(&event_id).await })
    }

    fn find_by_status(
        &self,
        status: DeadLetterStatus,
        offset: usize,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterRecord>>> + Send + '_>> {
        Box::pin(
            async move { self.storage.dead_letters.find_by_status(status, offset, limit).await },
        )
    }

    fn recover_dead_letters(
        &self,
        query: RecoveryQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterRecord>>> + Send + '_>> {
        Box::pin(async move {
            self.storage
                .dead_letters
                .find_recoverable(
                    query.retryable,
                    query.status,
                    query.offset,
                    query.limit,
                    query.max_retry,
                )
                .await
        })
    }

    fn mark_recovered(
        &self,
        event_id: EventId,
        partition: i32,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        Box::pin(async move {
            let changed =
                self.storage.dead_letters.mark_recovered(&event_id, partition, offset).await?;
            if changed {
                info!(event_id = %event_id, partition, offset, "dead letter recovered");
            }
            Ok(changed)
        })
    }

    fn handle_retry_failure(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<RetryFailureOutcome>> + Send + '_>> {
        Box::pin(async move {
            let repository = &self.storage.dead_letters;
            let mut tx = repository.begin().await?;

            let Some(mut record) = repository.find_by_id_for_update(&mut tx, &event_id).await?
            else {
                tx.rollback().await?;
                log_retry_failure(&event_id, RetryFailureOutcome::NotFound);
                return Ok(RetryFailureOutcome::NotFound);
            };

            let outcome = apply_retry_failure(&mut record, self.max_retry, self.clock.now_utc())?;
            if outcome != RetryFailureOutcome::AlreadyRecovered {
                repository.update_retry_state(&mut tx, &record).await?;
            }
            tx.commit().await?;

            log_retry_failure(&event_id, outcome);
            Ok(outcome)
        })
    }

    fn purge_recovered_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        Box::pin(async move { self.storage.dead_letters.delete_recovered_before(cutoff).await })
    }
}

pub mod memory {
    //! In-memory dead-letter store for tests.
    //!
    //! Mirrors the PostgreSQL adapter's filtering and ordering. Injected
    //! errors fire once on the next matching operation.

    use std::{
        collections::HashMap,
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use chrono::{DateTime, Utc};
    use courier_core::{
        error::{CoreError, Result},
        models::{DeadLetterRecord, DeadLetterStatus, EventId},
        Clock,
    };
    use tokio::sync::RwLock;

    use super::{
        apply_retry_failure, log_retry_failure, DeadLetterStore, RecoveryQuery,
        RetryFailureOutcome,
    };

    /// In-memory store with error injection and an operation counter.
    #[derive(Clone)]
    pub struct InMemoryDeadLetterStore {
        records: Arc<RwLock<HashMap<EventId, DeadLetterRecord>>>,
        clock: Arc<dyn Clock>,
        max_retry: u32,
        save_error: Arc<RwLock<Option<String>>>,
        fetch_error: Arc<RwLock<Option<String>>>,
        update_error: Arc<RwLock<Option<String>>>,
        operations: Arc<AtomicUsize>,
    }

    impl InMemoryDeadLetterStore {
        /// Creates an empty store.
        pub fn new(clock: Arc<dyn Clock>, max_retry: u32) -> Self {
            Self {
                records: Arc::new(RwLock::new(HashMap::new())),
                clock,
                max_retry,
                save_error: Arc::new(RwLock::new(None)),
                fetch_error: Arc::new(RwLock::new(None)),
                update_error: Arc::new(RwLock::new(None)),
                operations: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Seeds a record without counting an operation.
        pub async fn insert(&self, record: DeadLetterRecord) {
            self.records.write().await.insert(record.event_id().clone(), record);
        }

        /// Reads a record without counting an operation.
        pub async fn get(&self, event_id: &EventId) -> Option<DeadLetterRecord> {
            self.records.read().await.get(event_id).cloned()
        }

        /// All stored records, oldest first.
        pub async fn records(&self) -> Vec<DeadLetterRecord> {
            let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
            sort_oldest_first(&mut records);
            records
        }

        /// Number of stored records.
        pub async fn len(&self) -> usize {
            self.records.read().await.len()
        }

        /// Whether the store holds no records.
        pub async fn is_empty(&self) -> bool {
            self.records.read().await.is_empty()
        }

        /// Fails the next `save`.
        pub async fn inject_save_error(&self, error: impl Into<String>) {
            *self.save_error.write().await = Some(error.into());
        }

        /// Fails the next read.
        pub async fn inject_fetch_error(&self, error: impl Into<String>) {
            *self.fetch_error.write().await = Some(error.into());
        }

        /// Fails the next write other than `save`.
        pub async fn inject_update_error(&self, error: impl Into<String>) {
            *self.update_error.write().await = Some(error.into());
        }

        /// Store operations performed through the trait.
        pub fn operation_count(&self) -> usize {
            self.operations.load(Ordering::SeqCst)
        }

        async fn begin_operation(&self, injected: &RwLock<Option<String>>) -> Result<()> {
            self.operations.fetch_add(1, Ordering::SeqCst);
            match injected.write().await.take() {
                Some(error) => Err(CoreError::Database(error)),
                None => Ok(()),
            }
        }
    }

    fn sort_oldest_first(records: &mut [DeadLetterRecord]) {
        records.sort_by(|a, b| {
            a.created_at().cmp(&b.created_at()).then_with(|| a.event_id().cmp(b.event_id()))
        });
    }

    fn page(
        mut records: Vec<DeadLetterRecord>,
        offset: usize,
        limit: usize,
    ) -> Vec<DeadLetterRecord> {
        sort_oldest_first(&mut records);
        records.into_iter().skip(offset).take(limit).collect()
    }

    impl DeadLetterStore for InMemoryDeadLetterStore {
        fn save(
            &self,
            record: DeadLetterRecord,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.begin_operation(&self.save_error).await?;
                self.records.write().await.insert(record.event_id().clone(), record);
                Ok(())
            })
        }

        fn find_by_id(
            &self,
            event_id: EventId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<DeadLetterRecord>>> + Send + '_>> {
            Box::pin(async move {
                self.begin_operation(&self.fetch_error).await?;
                Ok(self.records.read().await.get(&event_id).cloned())
            })
        }

        fn find_by_status(
            &self,
            status: DeadLetterStatus,
            offset: usize,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterRecord>>> + Send + '_>> {
            Box::pin(async move {
                self.begin_operation(&self.fetch_error).await?;
                let matching = self
                    .records
                    .read()
                    .await
                    .values()
                    .filter(|record| record.status() == status)
                    .cloned()
                    .collect();
                Ok(page(matching, offset, limit))
            })
        }

        fn recover_dead_letters(
            &self,
            query: RecoveryQuery,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterRecord>>> + Send + '_>> {
            Box::pin(async move {
                self.begin_operation(&self.fetch_error).await?;
                let matching = self
                    .records
                    .read()
                    .await
                    .values()
                    .filter(|record| {
                        record.is_retryable() == query.retryable
                            && record.status() == query.status
                            && record.retry_count() < query.max_retry
                    })
                    .cloned()
                    .collect();
                Ok(page(matching, query.offset, query.limit))
            })
        }

        fn mark_recovered(
            &self,
            event_id: EventId,
            partition: i32,
            offset: i64,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            Box::pin(async move {
                self.begin_operation(&self.update_error).await?;
                Ok(self
                    .records
                    .write()
                    .await
                    .get_mut(&event_id)
                    .is_some_and(|record| record.mark_recovered(partition, offset)))
            })
        }

        fn handle_retry_failure(
            &self,
            event_id: EventId,
        ) -> Pin<Box<dyn Future<Output = Result<RetryFailureOutcome>> + Send + '_>> {
            Box::pin(async move {
                self.begin_operation(&self.update_error).await?;
                let mut records = self.records.write().await;

                let outcome = match records.get(&event_id) {
                    None => RetryFailureOutcome::NotFound,
                    Some(stored) => {
                        let mut updated = stored.clone();
                        let now = self.clock.now_utc();
                        let outcome = apply_retry_failure(&mut updated, self.max_retry, now)?;
                        records.insert(event_id.clone(), updated);
                        outcome
                    },
                };
                drop(records);

                log_retry_failure(&event_id, outcome);
                Ok(outcome)
            })
        }

        fn purge_recovered_before(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            Box::pin(async move {
                self.begin_operation(&self.update_error).await?;
                let mut records = self.records.write().await;
                let before = records.len();
                records.retain(|_, record| {
                    record.status() != DeadLetterStatus::Recovered || record.created_at() >= cutoff
                });
                Ok(u64::try_from(before - records.len()).unwrap_or(u64::MAX))
            })
        }
    }
}
