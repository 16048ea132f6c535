//! Domain models for events in flight and dead-lettered events.
//!
//! `EventEnvelope` is the immutable unit producers hand to the publisher.
//! `OutboundEvent` distinguishes a first delivery attempt from a retry of a
//! previously failed event. `DeadLetterRecord` is the aggregate that tracks a
//! failed event through recovery; its fields only change through the domain
//! methods so the retry and recovery invariants hold at every step.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Business event identifier.
///
/// Event ids are assigned by producers and double as the dead-letter primary
/// key, so a retry of the same event always upserts the same record.
///
/// # Example
///
/// ```
/// use courier_core::models::EventId;
/// let event_id = EventId::new();
/// println!("publishing event {}", event_id);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    /// Creates a new random event id (UUID v4).
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.to_string())
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let id = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Immutable event in flight.
///
/// Built once by business code and then only read. The payload is an opaque
/// serialized string; the publishing pipeline never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_id: EventId,
    topic: String,
    key: String,
    value: String,
    trace_id: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    publish_time: DateTime<Utc>,
}

impl EventEnvelope {
    /// Creates an envelope with a freshly generated event id.
    pub fn new(
        topic: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
        trace_id: impl Into<String>,
        publish_time: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            topic: topic.into(),
            key: key.into(),
            value: value.into(),
            trace_id: trace_id.into(),
            headers: HashMap::new(),
            publish_time,
        }
    }

    /// Creates an envelope whose value is the JSON encoding of `payload`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the payload cannot be serialized.
    pub fn json<T: Serialize>(
        topic: impl Into<String>,
        key: impl Into<String>,
        payload: &T,
        trace_id: impl Into<String>,
        publish_time: DateTime<Utc>,
    ) -> Result<Self> {
        let value = serde_json::to_string(payload).map_err(|e| {
            CoreError::InvalidInput(format!("event payload is not serializable: {e}"))
        })?;
        Ok(Self::new(topic, key, value, trace_id, publish_time))
    }

    /// Replaces the generated event id with a producer-assigned one.
    pub fn with_event_id(mut self, event_id: impl Into<EventId>) -> Self {
        self.event_id = event_id.into();
        self
    }

    /// Adds a transport header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Event identifier.
    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    /// Destination topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partitioning key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Serialized payload.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Distributed trace id propagated with the event.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Transport headers.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Time the producer created the event.
    pub fn publish_time(&self) -> DateTime<Utc> {
        self.publish_time
    }
}

/// Retry of a previously failed event, carrying its prior delivery context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEvent {
    /// The original event.
    pub envelope: EventEnvelope,
    /// Partition of the last delivery attempt, if the broker assigned one.
    pub partition: Option<i32>,
    /// Offset of the last delivery attempt, if any.
    pub offset: Option<i64>,
    /// Failed recovery attempts so far.
    pub retry_count: u32,
}

/// Event handed to the publisher.
///
/// Callers must handle both shapes: a first attempt produces a new dead letter
/// on failure, while a retry updates the existing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    /// First delivery attempt of a business event.
    Origin(EventEnvelope),
    /// Republish of a dead-lettered event.
    Retry(RetryEvent),
}

impl OutboundEvent {
    /// The wrapped envelope.
    pub fn envelope(&self) -> &EventEnvelope {
        match self {
            Self::Origin(envelope) => envelope,
            Self::Retry(retry) => &retry.envelope,
        }
    }

    /// Identifier of the wrapped event.
    pub fn event_id(&self) -> &EventId {
        self.envelope().event_id()
    }

    /// Partitioning key of the wrapped event.
    pub fn key(&self) -> &str {
        self.envelope().key()
    }

    /// Partition the send must target, if any.
    ///
    /// Retries go back to the partition of the previous attempt when one is
    /// known; first attempts let the broker choose.
    pub fn pinned_partition(&self) -> Option<i32> {
        match self {
            Self::Origin(_) => None,
            Self::Retry(retry) => retry.partition,
        }
    }

    /// Partition and offset recorded by an earlier attempt.
    pub fn prior_position(&self) -> (Option<i32>, Option<i64>) {
        match self {
            Self::Origin(_) => (None, None),
            Self::Retry(retry) => (retry.partition, retry.offset),
        }
    }

    /// Whether this is a retry of a dead letter.
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }
}

/// Recovery status of a dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    /// Delivery failed and has not been recovered.
    Dead,
    /// A later republish succeeded. Terminal.
    Recovered,
}

impl DeadLetterStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dead => "dead",
            Self::Recovered => "recovered",
        }
    }
}

impl fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for DeadLetterStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeadLetterStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "dead" => Ok(Self::Dead),
            "recovered" => Ok(Self::Recovered),
            _ => Err(format!("invalid dead letter status: {s}").into()),
        }
    }
}

/// Why a delivery failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureContext {
    /// Human-readable error message.
    pub error_message: String,
    /// Classified error kind of the failure.
    pub error_kind: String,
    /// Error kind of the direct cause, if any.
    pub cause_kind: Option<String>,
    /// Diagnostic detail captured at failure time.
    pub stack_snapshot: Option<String>,
}

impl FailureContext {
    /// Creates a failure context without cause or diagnostics.
    pub fn new(error_message: impl Into<String>, error_kind: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
            error_kind: error_kind.into(),
            cause_kind: None,
            stack_snapshot: None,
        }
    }

    /// Sets the cause kind.
    pub fn with_cause_kind(mut self, cause_kind: impl Into<String>) -> Self {
        self.cause_kind = Some(cause_kind.into());
        self
    }

    /// Sets the diagnostic snapshot.
    pub fn with_stack_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.stack_snapshot = Some(snapshot.into());
        self
    }
}

/// Every field of a dead letter, used to rebuild the aggregate from storage.
#[derive(Debug, Clone)]
pub struct DeadLetterParts {
    /// Event identifier.
    pub event_id: EventId,
    /// Destination topic.
    pub topic: String,
    /// Partitioning key.
    pub key: String,
    /// Serialized payload.
    pub value: String,
    /// Trace id.
    pub trace_id: String,
    /// Transport headers.
    pub headers: HashMap<String, String>,
    /// Original publish time.
    pub timestamp: DateTime<Utc>,
    /// Failure details.
    pub failure: FailureContext,
    /// Partition of the failed attempt.
    pub partition: Option<i32>,
    /// Offset of the failed attempt.
    pub offset: Option<i64>,
    /// Failed recovery attempts.
    pub retry_count: u32,
    /// Whether automatic recovery may pick the record up.
    pub retryable: bool,
    /// Informational next retry time.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Recovery status.
    pub status: DeadLetterStatus,
    /// Partition of the successful republish.
    pub recovered_partition: Option<i32>,
    /// Offset of the successful republish.
    pub recovered_offset: Option<i64>,
    /// When the dead letter was first recorded.
    pub created_at: DateTime<Utc>,
}

/// Durable record of an event that failed to deliver.
///
/// # Invariants
///
/// - A retryable record has `retry_count` below the configured cap; reaching
///   the cap clears `retryable`.
/// - A recovered record is not retryable and carries both the recovered
///   partition and offset.
/// - `next_retry_at`, when set, lies after the creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    event_id: EventId,
    topic: String,
    key: String,
    value: String,
    trace_id: String,
    headers: HashMap<String, String>,
    timestamp: DateTime<Utc>,
    failure: FailureContext,
    partition: Option<i32>,
    offset: Option<i64>,
    retry_count: u32,
    retryable: bool,
    next_retry_at: Option<DateTime<Utc>>,
    status: DeadLetterStatus,
    recovered_partition: Option<i32>,
    recovered_offset: Option<i64>,
    created_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Records the first delivery failure of `envelope`.
    ///
    /// The new record is `Dead` with no retries yet.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if a required field is blank.
    pub fn create(
        envelope: &EventEnvelope,
        failure: FailureContext,
        retryable: bool,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        Self::reconstitute(DeadLetterParts {
            event_id: envelope.event_id().clone(),
            topic: envelope.topic().to_string(),
            key: envelope.key().to_string(),
            value: envelope.value().to_string(),
            trace_id: envelope.trace_id().to_string(),
            headers: envelope.headers().clone(),
            timestamp: envelope.publish_time(),
            failure,
            partition: None,
            offset: None,
            retry_count: 0,
            retryable,
            next_retry_at: None,
            status: DeadLetterStatus::Dead,
            recovered_partition: None,
            recovered_offset: None,
            created_at,
        })
    }

    /// Rebuilds a record from stored parts, re-checking every invariant.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for blank fields and
    /// `CoreError::InvalidState` for inconsistent recovery bookkeeping.
    pub fn reconstitute(parts: DeadLetterParts) -> Result<Self> {
        require_text("event_id", parts.event_id.as_str())?;
        require_text("key", &parts.key)?;
        require_text("topic", &parts.topic)?;
        require_text("value", &parts.value)?;
        require_text("error_message", &parts.failure.error_message)?;
        require_text("error_kind", &parts.failure.error_kind)?;

        if parts.status == DeadLetterStatus::Recovered {
            if parts.retryable {
                return Err(CoreError::InvalidState(format!(
                    "recovered dead letter {} cannot be retryable",
                    parts.event_id
                )));
            }
            if parts.recovered_partition.is_none() || parts.recovered_offset.is_none() {
                return Err(CoreError::InvalidState(format!(
                    "recovered dead letter {} is missing its partition or offset",
                    parts.event_id
                )));
            }
        }

        if let Some(next_retry_at) = parts.next_retry_at {
            if next_retry_at <= parts.created_at {
                return Err(CoreError::InvalidState(format!(
                    "dead letter {} has next_retry_at before its creation time",
                    parts.event_id
                )));
            }
        }

        Ok(Self {
            event_id: parts.event_id,
            topic: parts.topic,
            key: parts.key,
            value: parts.value,
            trace_id: parts.trace_id,
            headers: parts.headers,
            timestamp: parts.timestamp,
            failure: parts.failure,
            partition: parts.partition,
            offset: parts.offset,
            retry_count: parts.retry_count,
            retryable: parts.retryable,
            next_retry_at: parts.next_retry_at,
            status: parts.status,
            recovered_partition: parts.recovered_partition,
            recovered_offset: parts.recovered_offset,
            created_at: parts.created_at,
        })
    }

    /// Records the partition and offset of the failed attempt, when known.
    pub fn with_last_position(mut self, partition: Option<i32>, offset: Option<i64>) -> Self {
        self.partition = partition;
        self.offset = offset;
        self
    }

    /// Counts one more failed recovery attempt.
    ///
    /// Reaching `max_retry` makes the record permanently dead.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidState` if the record is recovered or the
    /// cap was already reached.
    pub fn increment_retry(&mut self, max_retry: u32) -> Result<u32> {
        if self.status == DeadLetterStatus::Recovered {
            return Err(CoreError::InvalidState(format!(
                "dead letter {} is already recovered",
                self.event_id
            )));
        }
        if self.retry_count >= max_retry {
            return Err(CoreError::InvalidState(format!(
                "dead letter {} already reached the retry cap of {max_retry}",
                self.event_id
            )));
        }

        self.retry_count += 1;
        if self.retry_count >= max_retry {
            self.mark_failed();
        }
        Ok(self.retry_count)
    }

    /// Marks the record recovered at the given broker position.
    ///
    /// Returns `false` without changing anything if it was already
    /// recovered.
    pub fn mark_recovered(&mut self, partition: i32, offset: i64) -> bool {
        if self.status == DeadLetterStatus::Recovered {
            return false;
        }
        self.status = DeadLetterStatus::Recovered;
        self.retryable = false;
        self.next_retry_at = None;
        self.recovered_partition = Some(partition);
        self.recovered_offset = Some(offset);
        true
    }

    /// Stops automatic recovery. The record stays dead for manual handling.
    pub fn mark_failed(&mut self) {
        self.retryable = false;
        self.next_retry_at = None;
    }

    /// Stamps when the next attempt should happen.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if `at` is not after both `now` and
    /// the creation time, and `CoreError::InvalidState` if the record is not
    /// pending retry.
    pub fn schedule_next_retry(&mut self, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        if !self.is_pending_retry() {
            return Err(CoreError::InvalidState(format!(
                "dead letter {} is not pending retry",
                self.event_id
            )));
        }
        if at <= now || at <= self.created_at {
            return Err(CoreError::InvalidInput(format!(
                "next retry time {at} for dead letter {} is not in the future",
                self.event_id
            )));
        }
        self.next_retry_at = Some(at);
        Ok(())
    }

    /// Whether another automatic attempt is allowed under `max_retry`.
    pub fn can_retry(&self, max_retry: u32) -> bool {
        self.is_pending_retry() && self.retry_count < max_retry
    }

    /// Dead and still eligible for automatic recovery.
    pub fn is_pending_retry(&self) -> bool {
        self.status == DeadLetterStatus::Dead && self.retryable
    }

    /// Rebuilds the original envelope.
    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id.clone(),
            topic: self.topic.clone(),
            key: self.key.clone(),
            value: self.value.clone(),
            trace_id: self.trace_id.clone(),
            headers: self.headers.clone(),
            publish_time: self.timestamp,
        }
    }

    /// Builds the retry event used to republish this record.
    pub fn to_outbound(&self) -> OutboundEvent {
        OutboundEvent::Retry(RetryEvent {
            envelope: self.envelope(),
            partition: self.partition,
            offset: self.offset,
            retry_count: self.retry_count,
        })
    }

    /// Event identifier.
    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    /// Destination topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partitioning key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Serialized payload.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Trace id.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Transport headers.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Original publish time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Failure details.
    pub fn failure(&self) -> &FailureContext {
        &self.failure
    }

    /// Partition of the failed attempt.
    pub fn partition(&self) -> Option<i32> {
        self.partition
    }

    /// Offset of the failed attempt.
    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    /// Failed recovery attempts.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Whether automatic recovery may pick the record up.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Informational next retry time.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.next_retry_at
    }

    /// Recovery status.
    pub fn status(&self) -> DeadLetterStatus {
        self.status
    }

    /// Partition of the successful republish.
    pub fn recovered_partition(&self) -> Option<i32> {
        self.recovered_partition
    }

    /// Offset of the successful republish.
    pub fn recovered_offset(&self) -> Option<i64> {
        self.recovered_offset
    }

    /// When the dead letter was first recorded.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CoreError::InvalidInput(format!("{field} must not be blank")));
    }
    Ok(())
}
