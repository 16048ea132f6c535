//! Core domain model for reliable business-event publishing.
//!
//! Provides the immutable event envelope, the dead-letter aggregate with its
//! recovery state machine, a clock abstraction for deterministic tests, and
//! the PostgreSQL repositories that persist dead letters and scheduler
//! leases. The delivery crate builds publishing and recovery on top of these
//! types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    DeadLetterParts, DeadLetterRecord, DeadLetterStatus, EventEnvelope, EventId, FailureContext,
    OutboundEvent, RetryEvent,
};
pub use time::{Clock, RealClock, TestClock};
