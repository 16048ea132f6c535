//! Publisher wrapping the broker client.
//!
//! Converts raw send outcomes into `PublishResult` values. A publish never
//! returns an error: synchronous rejections and failed acknowledgements both
//! become failed results so the caller can classify them uniformly.

use std::{sync::Arc, time::Duration};

use courier_core::models::{EventId, OutboundEvent};
use futures::future::{self, join_all, BoxFuture, FutureExt};
use tracing::{debug, error, warn};

use crate::{
    broker::{BrokerClient, BrokerError, BrokerRecord, RecordMetadata},
    error::{DeliveryError, Result},
};

/// Outcome of a single send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker acknowledged the record.
    Delivered(RecordMetadata),
    /// The send failed before or after reaching the broker.
    Failed(BrokerError),
}

/// Result of publishing one event. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    event: OutboundEvent,
    outcome: PublishOutcome,
}

impl PublishResult {
    /// Successful result.
    pub fn delivered(event: OutboundEvent, metadata: RecordMetadata) -> Self {
        Self { event, outcome: PublishOutcome::Delivered(metadata) }
    }

    /// Failed result.
    pub fn failed(event: OutboundEvent, error: BrokerError) -> Self {
        Self { event, outcome: PublishOutcome::Failed(error) }
    }

    /// The published event.
    pub fn event(&self) -> &OutboundEvent {
        &self.event
    }

    /// Identifier of the published event.
    pub fn event_id(&self) -> &EventId {
        self.event.event_id()
    }

    /// Partitioning key of the published event.
    pub fn key(&self) -> &str {
        self.event.key()
    }

    /// Send outcome.
    pub fn outcome(&self) -> &PublishOutcome {
        &self.outcome
    }

    /// Partition of this send, or of the previous attempt when a retry
    /// failed.
    pub fn partition(&self) -> Option<i32> {
        match &self.outcome {
            PublishOutcome::Delivered(metadata) => Some(metadata.partition),
            PublishOutcome::Failed(_) => self.event.prior_position().0,
        }
    }

    /// Offset of this send, or of the previous attempt when a retry failed.
    pub fn offset(&self) -> Option<i64> {
        match &self.outcome {
            PublishOutcome::Delivered(metadata) => Some(metadata.offset),
            PublishOutcome::Failed(_) => self.event.prior_position().1,
        }
    }

    /// The failure, absent on success.
    pub fn error(&self) -> Option<&BrokerError> {
        match &self.outcome {
            PublishOutcome::Delivered(_) => None,
            PublishOutcome::Failed(error) => Some(error),
        }
    }

    /// Broker position when delivered.
    pub fn metadata(&self) -> Option<RecordMetadata> {
        match &self.outcome {
            PublishOutcome::Delivered(metadata) => Some(*metadata),
            PublishOutcome::Failed(_) => None,
        }
    }

    /// Whether the broker acknowledged the event.
    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, PublishOutcome::Delivered(_))
    }
}

/// Sends events through a broker client.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn BrokerClient>,
}

impl Publisher {
    /// Creates a publisher over `broker`.
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self { broker }
    }

    /// Sends one event and resolves to its result.
    ///
    /// Retries are pinned to the partition of their previous attempt when
    /// it is known.
    pub fn publish_async(&self, event: OutboundEvent) -> BoxFuture<'static, PublishResult> {
        let envelope = event.envelope();
        let sent = self.broker.send(BrokerRecord {
            topic: envelope.topic(),
            key: envelope.key(),
            envelope,
            partition: event.pinned_partition(),
        });

        match sent {
            Ok(pending) => async move {
                match pending.await {
                    Ok(metadata) => {
                        debug!(
                            event_id = %event.event_id(),
                            partition = metadata.partition,
                            offset = metadata.offset,
                            retry = event.is_retry(),
                            "event published"
                        );
                        PublishResult::delivered(event, metadata)
                    },
                    Err(error) => {
                        warn!(
                            event_id = %event.event_id(),
                            error_kind = %error.kind,
                            error = %error,
                            retry = event.is_retry(),
                            "event publish failed"
                        );
                        PublishResult::failed(event, error)
                    },
                }
            }
            .boxed(),
            Err(error) => {
                warn!(
                    event_id = %event.event_id(),
                    error_kind = %error.kind,
                    error = %error,
                    "broker rejected event before sending"
                );
                future::ready(PublishResult::failed(event, error)).boxed()
            },
        }
    }

    /// Sends all events concurrently and waits for every one to finish.
    ///
    /// Results are returned in input order.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::BatchAborted` if any send task dies before
    /// producing a result.
    pub async fn publish_batch_async(
        &self,
        events: Vec<OutboundEvent>,
    ) -> Result<Vec<PublishResult>> {
        let handles: Vec<_> =
            events.into_iter().map(|event| tokio::spawn(self.publish_async(event))).collect();

        let mut results = Vec::with_capacity(handles.len());
        for joined in join_all(handles).await {
            match joined {
                Ok(result) => results.push(result),
                Err(join_error) => {
                    error!(error = %join_error, "publish task failed, aborting batch");
                    return Err(DeliveryError::batch_aborted(join_error.to_string()));
                },
            }
        }

        Ok(results)
    }

    /// Sends one event and waits at most `timeout` for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Timeout` when the wait elapses and
    /// `DeliveryError::Broker` when the send fails.
    pub async fn publish(&self, event: OutboundEvent, timeout: Duration) -> Result<RecordMetadata> {
        match tokio::time::timeout(timeout, self.publish_async(event)).await {
            Ok(result) => match result.outcome {
                PublishOutcome::Delivered(metadata) => Ok(metadata),
                PublishOutcome::Failed(error) => Err(DeliveryError::Broker(error)),
            },
            Err(_elapsed) => Err(DeliveryError::timeout(timeout)),
        }
    }
}
