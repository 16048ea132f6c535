//! Failure classification for publish results.
//!
//! `FailureClassifier::classify` is a pure mapping from a publish result to
//! the dead-letter bookkeeping it requires:
//!
//! | outcome   | origin event          | retry event             |
//! |-----------|-----------------------|-------------------------|
//! | delivered | nothing               | mark recovered          |
//! | failed    | save a new dead letter| record a retry failure  |
//!
//! Retryability of a new dead letter comes from two configured sets of
//! broker error kinds. The non-retryable set wins over the retryable set, and
//! kinds in neither set are treated as non-retryable.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result,
    models::{DeadLetterRecord, EventId, FailureContext, OutboundEvent},
};
use serde::{Deserialize, Serialize};

use crate::{
    broker::{BrokerError, BrokerErrorKind, RecordMetadata},
    publisher::{PublishOutcome, PublishResult},
};

/// Configured retryable and non-retryable error kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Kinds safe to retry automatically.
    pub retryable: Vec<BrokerErrorKind>,
    /// Kinds never retried, even if also listed as retryable.
    pub non_retryable: Vec<BrokerErrorKind>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            retryable: BrokerErrorKind::ALL
                .into_iter()
                .filter(BrokerErrorKind::is_transient)
                .collect(),
            non_retryable: vec![BrokerErrorKind::MissingValue, BrokerErrorKind::InvalidRecord],
        }
    }
}

/// Bookkeeping a publish result requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterAction {
    /// First attempt succeeded.
    None,
    /// A retry succeeded.
    MarkRecovered {
        /// Recovered event.
        event_id: EventId,
        /// Position of the successful republish.
        metadata: RecordMetadata,
    },
    /// A first attempt failed.
    SaveDeadLetter(Box<DeadLetterRecord>),
    /// A retry failed.
    RecordRetryFailure {
        /// Event whose retry failed.
        event_id: EventId,
    },
}

/// Decides retryability and dead-letter bookkeeping.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    retryable: HashSet<BrokerErrorKind>,
    non_retryable: HashSet<BrokerErrorKind>,
}

impl FailureClassifier {
    /// Creates a classifier from configured kind sets.
    pub fn new(config: &ClassifierConfig) -> Self {
        Self {
            retryable: config.retryable.iter().copied().collect(),
            non_retryable: config.non_retryable.iter().copied().collect(),
        }
    }

    /// Whether a failure with this error may be retried automatically.
    ///
    /// Looks at the error's own kind and its direct cause.
    pub fn is_retryable(&self, error: &BrokerError) -> bool {
        let kinds = || std::iter::once(error.kind).chain(error.cause);

        if kinds().any(|kind| self.non_retryable.contains(&kind)) {
            return false;
        }
        kinds().any(|kind| self.retryable.contains(&kind))
    }

    /// Maps a publish result to the bookkeeping it requires.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if a failed origin event cannot be
    /// turned into a valid dead letter, for example because its key is blank.
    pub fn classify(&self, result: &PublishResult, now: DateTime<Utc>) -> Result<DeadLetterAction> {
        match (result.event(), result.outcome()) {
            (OutboundEvent::Origin(_), PublishOutcome::Delivered(_)) => Ok(DeadLetterAction::None),
            (OutboundEvent::Retry(retry), PublishOutcome::Delivered(metadata)) => {
                Ok(DeadLetterAction::MarkRecovered {
                    event_id: retry.envelope.event_id().clone(),
                    metadata: *metadata,
                })
            },
            (OutboundEvent::Origin(envelope), PublishOutcome::Failed(error)) => {
                let record = DeadLetterRecord::create(
                    envelope,
                    failure_context(error),
                    self.is_retryable(error),
                    now,
                )?
                .with_last_position(result.partition(), result.offset());
                Ok(DeadLetterAction::SaveDeadLetter(Box::new(record)))
            },
            (OutboundEvent::Retry(retry), PublishOutcome::Failed(_)) => {
                Ok(DeadLetterAction::RecordRetryFailure {
                    event_id: retry.envelope.event_id().clone(),
                })
            },
        }
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}

/// Failure details stored with a dead letter.
pub fn failure_context(error: &BrokerError) -> FailureContext {
    let message = if error.message.trim().is_empty() {
        error.kind.to_string()
    } else {
        error.message.clone()
    };

    let mut context = FailureContext::new(message, error.kind.as_str());
    if let Some(cause) = error.cause {
        context = context.with_cause_kind(cause.as_str());
    }
    if let Some(detail) = &error.detail {
        context = context.with_stack_snapshot(detail.clone());
    }
    context
}
