//! Broker client port.
//!
//! The publisher talks to the message broker only through `BrokerClient`.
//! Adapters translate their native failures into the closed
//! `BrokerErrorKind` enum so classification never depends on error types
//! from a particular client library.
//!
//! `send` has two failure points. An `Err` returned directly means the send
//! never started (queue full, producer closed, invalid record); an `Err` from
//! the returned future means the broker did not acknowledge the record.

use std::{fmt, future::Future, pin::Pin};

use courier_core::models::EventEnvelope;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of broker failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerErrorKind {
    /// Connection to the broker failed or was lost.
    Connection,
    /// Send or acknowledgement timed out.
    Timeout,
    /// Broker host name could not be resolved.
    UnknownHost,
    /// Not enough in-sync replicas to accept the write.
    NotEnoughReplicas,
    /// Write was appended but too few replicas acknowledged it.
    NotEnoughReplicasAfterAppend,
    /// Producer transaction timed out.
    TransactionTimedOut,
    /// Local producer queue is full.
    QueueFull,
    /// Payload could not be deserialized.
    Deserialization,
    /// Payload could not be serialized.
    Serialization,
    /// Record exceeds the broker's size limit.
    RecordTooLarge,
    /// Topic or partition does not exist.
    UnknownTopic,
    /// Producer is not authorized for the topic.
    Authorization,
    /// Record failed validation.
    InvalidRecord,
    /// A required value was absent.
    MissingValue,
    /// Anything the adapter could not classify.
    Unknown,
}

impl BrokerErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 15] = [
        Self::Connection,
        Self::Timeout,
        Self::UnknownHost,
        Self::NotEnoughReplicas,
        Self::NotEnoughReplicasAfterAppend,
        Self::TransactionTimedOut,
        Self::QueueFull,
        Self::Deserialization,
        Self::Serialization,
        Self::RecordTooLarge,
        Self::UnknownTopic,
        Self::Authorization,
        Self::InvalidRecord,
        Self::MissingValue,
        Self::Unknown,
    ];

    /// Stable snake_case name, also used as the stored error kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::UnknownHost => "unknown_host",
            Self::NotEnoughReplicas => "not_enough_replicas",
            Self::NotEnoughReplicasAfterAppend => "not_enough_replicas_after_append",
            Self::TransactionTimedOut => "transaction_timed_out",
            Self::QueueFull => "queue_full",
            Self::Deserialization => "deserialization",
            Self::Serialization => "serialization",
            Self::RecordTooLarge => "record_too_large",
            Self::UnknownTopic => "unknown_topic",
            Self::Authorization => "authorization",
            Self::InvalidRecord => "invalid_record",
            Self::MissingValue => "missing_value",
            Self::Unknown => "unknown",
        }
    }

    /// Kinds that usually clear up without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection
                | Self::Timeout
                | Self::UnknownHost
                | Self::NotEnoughReplicas
                | Self::NotEnoughReplicasAfterAppend
                | Self::TransactionTimedOut
                | Self::QueueFull
                | Self::Deserialization
        )
    }
}

impl fmt::Display for BrokerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a broker adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct BrokerError {
    /// Classified failure kind.
    pub kind: BrokerErrorKind,
    /// Adapter-provided message.
    pub message: String,
    /// Kind of the underlying cause, when the adapter knows it.
    pub cause: Option<BrokerErrorKind>,
    /// Diagnostic detail, such as the native error's debug output.
    pub detail: Option<String>,
}

impl BrokerError {
    /// Creates an error of the given kind.
    pub fn new(kind: BrokerErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), cause: None, detail: None }
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Connection, message)
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Timeout, message)
    }

    /// Records the kind of the underlying cause.
    pub fn with_cause(mut self, cause: BrokerErrorKind) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Attaches diagnostic detail.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Broker position of an acknowledged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Partition the record was written to.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
}

/// One record to send.
#[derive(Debug, Clone, Copy)]
pub struct BrokerRecord<'a> {
    /// Destination topic.
    pub topic: &'a str,
    /// Partitioning key.
    pub key: &'a str,
    /// Event being sent.
    pub envelope: &'a EventEnvelope,
    /// Explicit partition, or `None` to let the broker choose.
    pub partition: Option<i32>,
}

/// Pending broker acknowledgement.
pub type SendFuture =
    Pin<Box<dyn Future<Output = Result<RecordMetadata, BrokerError>> + Send + 'static>>;

/// Asynchronous send primitive of a message broker.
pub trait BrokerClient: Send + Sync + 'static {
    /// Starts sending `record`.
    ///
    /// # Errors
    ///
    /// Returns the error directly when the send cannot even be started.
    fn send(&self, record: BrokerRecord<'_>) -> Result<SendFuture, BrokerError>;
}

pub mod mock {
    //! Scripted broker for tests and local runs.
    //!
    //! Acknowledges every record by default, assigning partitions from the
    //! key and increasing offsets. Failures can be scripted per event, for
    //! every send, or as synchronous rejections.

    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicI64, Ordering},
            Arc, Mutex, MutexGuard, PoisonError,
        },
        time::Duration,
    };

    use courier_core::models::EventId;

    use super::{BrokerClient, BrokerError, BrokerRecord, RecordMetadata, SendFuture};

    /// A record the mock was asked to send.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SentRecord {
        /// Event id of the record.
        pub event_id: EventId,
        /// Destination topic.
        pub topic: String,
        /// Partitioning key.
        pub key: String,
        /// Explicit partition requested by the publisher.
        pub partition: Option<i32>,
    }

    #[derive(Debug, Default)]
    struct Script {
        event_failures: HashMap<EventId, BrokerError>,
        fail_all: Option<BrokerError>,
        reject_all: Option<BrokerError>,
        latency: Option<Duration>,
        sent: Vec<SentRecord>,
    }

    /// In-memory broker with scriptable failures.
    #[derive(Debug, Clone)]
    pub struct MockBrokerClient {
        script: Arc<Mutex<Script>>,
        next_offset: Arc<AtomicI64>,
        partitions: i32,
    }

    impl MockBrokerClient {
        /// Creates a broker with three partitions that acknowledges everything.
        pub fn new() -> Self {
            Self::with_partitions(3)
        }

        /// Creates a broker with the given partition count.
        pub fn with_partitions(partitions: i32) -> Self {
            Self {
                script: Arc::new(Mutex::new(Script::default())),
                next_offset: Arc::new(AtomicI64::new(0)),
                partitions: partitions.max(1),
            }
        }

        fn script(&self) -> MutexGuard<'_, Script> {
            self.script.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Fails every future send of `event_id` asynchronously.
        pub fn fail_event(&self, event_id: EventId, error: BrokerError) {
            self.script().event_failures.insert(event_id, error);
        }

        /// Fails every send asynchronously, or stops doing so with `None`.
        pub fn fail_all(&self, error: Option<BrokerError>) {
            self.script().fail_all = error;
        }

        /// Rejects every send synchronously, or stops doing so with `None`.
        pub fn reject_all(&self, error: Option<BrokerError>) {
            self.script().reject_all = error;
        }

        /// Delays every acknowledgement.
        pub fn set_latency(&self, latency: Option<Duration>) {
            self.script().latency = latency;
        }

        /// Clears all scripted failures.
        pub fn heal(&self) {
            let mut script = self.script();
            script.event_failures.clear();
            script.fail_all = None;
            script.reject_all = None;
        }

        /// Records passed to `send`, including rejected ones.
        pub fn sent_records(&self) -> Vec<SentRecord> {
            self.script().sent.clone()
        }

        /// Number of `send` calls so far.
        pub fn send_count(&self) -> usize {
            self.script().sent.len()
        }

        fn partition_for(&self, key: &str) -> i32 {
            let hash = key
                .bytes()
                .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
            i32::try_from(hash % self.partitions.unsigned_abs()).unwrap_or(0)
        }
    }

    impl Default for MockBrokerClient {
        fn default() -> Self {
            Self::new()
        }
    }

    impl BrokerClient for MockBrokerClient {
        fn send(&self, record: BrokerRecord<'_>) -> Result<SendFuture, BrokerError> {
            let event_id = record.envelope.event_id().clone();
            let mut script = self.script();
            script.sent.push(SentRecord {
                event_id: event_id.clone(),
                topic: record.topic.to_string(),
                key: record.key.to_string(),
                partition: record.partition,
            });

            if let Some(error) = script.reject_all.clone() {
                return Err(error);
            }

            let failure =
                script.fail_all.clone().or_else(|| script.event_failures.get(&event_id).cloned());
            let latency = script.latency;
            drop(script);

            let partition = record.partition.unwrap_or_else(|| self.partition_for(record.key));
            let offset = self.next_offset.fetch_add(1, Ordering::AcqRel);

            Ok(Box::pin(async move {
                if let Some(latency) = latency {
                    tokio::time::sleep(latency).await;
                }
                match failure {
                    Some(error) => Err(error),
                    None => Ok(RecordMetadata { partition, offset }),
                }
            }))
        }
    }
}
