//! Publishing service: publish, classify and record.
//!
//! `PublishService` is the entry point producers use. Every publish ends with
//! the classifier's bookkeeping applied to the dead-letter store, so a failed
//! first attempt is always either recorded or reported to the caller.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use courier_core::{
    models::{DeadLetterRecord, EventId, OutboundEvent},
    Clock,
};
use tracing::{error, warn};

use crate::{
    broker::BrokerError,
    classifier::{DeadLetterAction, FailureClassifier},
    error::{DeliveryError, Result},
    publisher::{PublishResult, Publisher},
    store::DeadLetterStore,
};

/// Publishing operations used by producers and the recovery scheduler.
pub trait EventPublishing: Send + Sync + 'static {
    /// Publishes one event and applies its dead-letter bookkeeping.
    ///
    /// Resolves to `true` when the broker acknowledged the event.
    fn publish_event(
        &self,
        event: OutboundEvent,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Publishes events concurrently and returns each result by event id.
    ///
    /// Failed origin events are dead-lettered. Retry events are returned
    /// untouched; their bookkeeping belongs to the caller.
    fn publish_batch(
        &self,
        events: Vec<OutboundEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<EventId, PublishResult>>> + Send + '_>>;
}

/// Default `EventPublishing` implementation.
pub struct PublishService {
    publisher: Publisher,
    classifier: FailureClassifier,
    store: Arc<dyn DeadLetterStore>,
    clock: Arc<dyn Clock>,
    publish_timeout: Duration,
}

impl PublishService {
    /// Creates a service with the default publish timeout.
    pub fn new(
        publisher: Publisher,
        classifier: FailureClassifier,
        store: Arc<dyn DeadLetterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            publisher,
            classifier,
            store,
            clock,
            publish_timeout: Duration::from_millis(crate::DEFAULT_PUBLISH_TIMEOUT_MS),
        }
    }

    /// Sets how long `publish_and_wait` waits for an acknowledgement.
    #[must_use]
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Publishes one event, giving up on the acknowledgement after the
    /// publish timeout.
    ///
    /// A timeout counts as a failed send, so a first attempt is
    /// dead-lettered.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DeadLetterPersistence` if the failure cannot be
    /// recorded.
    pub async fn publish_and_wait(&self, event: OutboundEvent) -> Result<bool> {
        let timeout = self.publish_timeout;
        let result =
            match tokio::time::timeout(timeout, self.publisher.publish_async(event.clone())).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    warn!(
                        event_id = %event.event_id(),
                        timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        "publish timed out waiting for acknowledgement"
                    );
                    let error = BrokerError::timeout(format!(
                        "no acknowledgement within {}ms",
                        timeout.as_millis()
                    ));
                    PublishResult::failed(event, error)
                },
            };

        self.settle(&result, true).await?;
        Ok(result.is_delivered())
    }

    /// Applies the bookkeeping for one result.
    ///
    /// Retry bookkeeping is skipped unless `apply_retry_bookkeeping` is set.
    async fn settle(&self, result: &PublishResult, apply_retry_bookkeeping: bool) -> Result<()> {
        let action = self
            .classifier
            .classify(result, self.clock.now_utc())
            .map_err(|e| DeliveryError::persistence(result.event_id(), e.to_string()))?;

        match action {
            DeadLetterAction::None => {},
            DeadLetterAction::SaveDeadLetter(record) => self.save_dead_letter(*record).await?,
            DeadLetterAction::MarkRecovered { event_id, metadata } => {
                if apply_retry_bookkeeping {
                    self.store.mark_recovered(event_id, metadata.partition, metadata.offset).await?;
                }
            },
            DeadLetterAction::RecordRetryFailure { event_id } => {
                if apply_retry_bookkeeping {
                    self.store.handle_retry_failure(event_id).await?;
                }
            },
        }
        Ok(())
    }

    async fn save_dead_letter(&self, record: DeadLetterRecord) -> Result<()> {
        let event_id = record.event_id().clone();
        let retryable = record.is_retryable();
        let error_kind = record.failure().error_kind.clone();

        self.store.save(record).await.map_err(|e| {
            error!(event_id = %event_id, error = %e, "failed to persist dead letter");
            DeliveryError::persistence(&event_id, e.to_string())
        })?;

        warn!(event_id = %event_id, retryable, error_kind, "event dead-lettered");
        Ok(())
    }
}

impl EventPublishing for PublishService {
    fn publish_event(
        &self,
        event: OutboundEvent,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        Box::pin(async move {
            let result = self.publisher.publish_async(event).await;
            self.settle(&result, true).await?;
            Ok(result.is_delivered())
        })
    }

    fn publish_batch(
        &self,
        events: Vec<OutboundEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<EventId, PublishResult>>> + Send + '_>> {
        Box::pin(async move {
            let results = self.publisher.publish_batch_async(events).await?;

            let mut first_error = None;
            for result in &results {
                if let Err(error) = self.settle(result, false).await {
                    first_error.get_or_insert(error);
                }
            }
            if let Some(error) = first_error {
                return Err(error);
            }

            Ok(results.into_iter().map(|result| (result.event_id().clone(), result)).collect())
        })
    }
}
