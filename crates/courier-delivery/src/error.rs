//! Error types for publishing and recovery operations.
//!
//! Broker send failures are carried as `BrokerError` values inside publish
//! results and only surface as `DeliveryError::Broker` when a caller asks for
//! a synchronous answer. Persistence failures while recording a dead letter
//! always surface, because an event that cannot be recorded as failed must
//! not be dropped silently.

use std::{fmt, time::Duration};

use courier_core::error::CoreError;
use thiserror::Error;

use crate::broker::BrokerError;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised by the publishing and recovery pipeline.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// The broker rejected or failed the send.
    #[error("broker send failed: {0}")]
    Broker(#[from] BrokerError),

    /// No broker acknowledgement within the publish timeout.
    #[error("publish timed out after {timeout_ms}ms")]
    Timeout {
        /// Milliseconds waited before giving up
        timeout_ms: u64,
    },

    /// A failed event could not be written to the dead-letter store.
    #[error("failed to persist dead letter for event {event_id}: {message}")]
    DeadLetterPersistence {
        /// Event that could not be recorded
        event_id: String,
        /// Underlying storage error
        message: String,
    },

    /// A concurrent batch publish did not complete.
    #[error("batch publish aborted: {message}")]
    BatchAborted {
        /// Reason the combined future failed
        message: String,
    },

    /// Dead-letter store operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Background tasks did not stop in time.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Configured shutdown timeout
        timeout: Duration,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates a dead-letter persistence error.
    pub fn persistence(event_id: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::DeadLetterPersistence { event_id: event_id.to_string(), message: message.into() }
    }

    /// Creates a batch aborted error.
    pub fn batch_aborted(message: impl Into<String>) -> Self {
        Self::BatchAborted { message: message.into() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Whether retrying the same operation later could succeed.
    ///
    /// Broker errors defer to their kind. Timeouts, aborted batches and
    /// storage outages are transient. Persistence of a specific dead letter,
    /// configuration, shutdown and internal errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Broker(error) => error.kind.is_transient(),
            Self::Timeout { .. } | Self::BatchAborted { .. } | Self::Storage { .. } => true,
            Self::DeadLetterPersistence { .. }
            | Self::ConfigurationError { .. }
            | Self::ShutdownTimeout { .. }
            | Self::InternalError { .. } => false,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        Self::storage(error.to_string())
    }
}

/// Category of delivery error for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Broker send failures and timeouts.
    Broker,
    /// Dead-letter store failures.
    Persistence,
    /// Configuration problems.
    Configuration,
    /// Lifecycle and internal errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Broker(_)
            | DeliveryError::Timeout { .. }
            | DeliveryError::BatchAborted { .. } => Self::Broker,
            DeliveryError::DeadLetterPersistence { .. } | DeliveryError::Storage { .. } => {
                Self::Persistence
            },
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::ShutdownTimeout { .. } | DeliveryError::InternalError { .. } => {
                Self::Internal
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broker => write!(f, "broker"),
            Self::Persistence => write!(f, "persistence"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerErrorKind;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::from(BrokerError::timeout("slow")).is_retryable());
        assert!(DeliveryError::timeout(Duration::from_secs(5)).is_retryable());
        assert!(DeliveryError::batch_aborted("task panicked").is_retryable());
        assert!(DeliveryError::storage("pool closed").is_retryable());

        assert!(!DeliveryError::from(BrokerError::new(BrokerErrorKind::InvalidRecord, "bad"))
            .is_retryable());
        assert!(!DeliveryError::persistence("evt-1", "disk full").is_retryable());
        assert!(!DeliveryError::configuration("batch_size is 0").is_retryable());
        assert!(!DeliveryError::internal("bug").is_retryable());
    }

    #[test]
    fn error_categories_mapped_correctly() {
        assert_eq!(
            ErrorCategory::from(&DeliveryError::timeout(Duration::from_millis(10))),
            ErrorCategory::Broker
        );
        assert_eq!(
            ErrorCategory::from(&DeliveryError::persistence("evt-1", "down")),
            ErrorCategory::Persistence
        );
        assert_eq!(
            ErrorCategory::from(&DeliveryError::configuration("bad")),
            ErrorCategory::Configuration
        );
        assert_eq!(ErrorCategory::Persistence.to_string(), "persistence");
    }

    #[test]
    fn error_display_format() {
        let error = DeliveryError::timeout(Duration::from_millis(1500));
        assert_eq!(error.to_string(), "publish timed out after 1500ms");

        let error = DeliveryError::persistence("evt-9", "connection reset");
        assert_eq!(
            error.to_string(),
            "failed to persist dead letter for event evt-9: connection reset"
        );
    }

    #[test]
    fn core_errors_become_storage_errors() {
        let error = DeliveryError::from(CoreError::Database("gone".to_string()));
        assert!(matches!(error, DeliveryError::Storage { .. }));
    }
}
