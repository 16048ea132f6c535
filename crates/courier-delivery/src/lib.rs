//! Reliable business-event publishing with dead-letter recovery.
//!
//! Producers publish through `PublishService`. A send the broker does not
//! acknowledge is classified and recorded as a dead letter; the
//! `RecoveryEngine` later republishes retryable dead letters in bounded pages
//! until they recover or exhaust their retries.
//!
//! # Architecture
//!
//! 1. **Publish** - `Publisher` sends through a `BrokerClient` and produces a
//!    `PublishResult` for every event, failed or not
//! 2. **Classify** - `FailureClassifier` maps each result to the dead-letter
//!    bookkeeping it requires
//! 3. **Record** - `DeadLetterStore` persists new dead letters and recovery
//!    outcomes
//! 4. **Recover** - `RecoveryScheduler` pages through retryable dead letters
//!    behind a cycle-level circuit breaker
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{models::{EventEnvelope, OutboundEvent}, Clock, RealClock};
//! use courier_delivery::{
//!     broker::mock::MockBrokerClient, store::memory::InMemoryDeadLetterStore,
//!     EventPublishing, FailureClassifier, PublishService, Publisher,
//! };
//!
//! # async fn example() -> courier_delivery::Result<()> {
//! let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
//! let store = Arc::new(InMemoryDeadLetterStore::new(clock.clone(), 5));
//! let service = PublishService::new(
//!     Publisher::new(Arc::new(MockBrokerClient::new())),
//!     FailureClassifier::default(),
//!     store,
//!     clock.clone(),
//! );
//!
//! let envelope = EventEnvelope::new("otp-issued", "user-42", "{}", "trace-1", clock.now_utc());
//! let delivered = service.publish_event(OutboundEvent::Origin(envelope)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod broker;
pub mod circuit;
pub mod classifier;
pub mod engine;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod lock;
pub mod publisher;
pub mod retention;
pub mod scheduler;
pub mod service;
pub mod store;

pub use broker::{BrokerClient, BrokerError, BrokerErrorKind, RecordMetadata};
pub use classifier::{ClassifierConfig, DeadLetterAction, FailureClassifier};
pub use engine::{RecoveryConfig, RecoveryEngine};
pub use error::{DeliveryError, Result};
pub use publisher::{PublishOutcome, PublishResult, Publisher};
pub use scheduler::{RecoveryScheduler, TickOutcome, TickReport};
pub use service::{EventPublishing, PublishService};
pub use store::{DeadLetterStore, PostgresDeadLetterStore, RecoveryQuery};

/// Default number of dead letters per recovery page.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default number of failed retries before a dead letter is abandoned.
pub const DEFAULT_MAX_RETRY: u32 = 5;

/// Default consecutive failed ticks that open the recovery circuit.
pub const DEFAULT_CIRCUIT_BREAKER_THRESHOLD: u32 = 3;

/// Default per-tick failure rate that counts as a failed tick.
pub const DEFAULT_FAILURE_RATE_THRESHOLD: f64 = 0.8;

/// Default pause between recovery ticks in milliseconds.
pub const DEFAULT_FIXED_DELAY_MS: u64 = 60_000;

/// Default wait for a broker acknowledgement in milliseconds.
pub const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 30_000;

/// Default days a recovered dead letter is kept.
pub const DEFAULT_RECOVERED_RETENTION_DAYS: u32 = 30;
