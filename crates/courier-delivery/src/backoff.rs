//! Stepped backoff for dead-letter retries.
//!
//! The delay only stamps `next_retry_at` on a record. Recovery ticks do not
//! consult it when fetching, so every retryable record is re-attempted on
//! every tick until it recovers or reaches the retry cap.

use std::time::Duration;

use chrono::{DateTime, Utc};

const FIRST_RETRY: Duration = Duration::from_secs(10);
const SECOND_RETRY: Duration = Duration::from_secs(20);
const THIRD_RETRY: Duration = Duration::from_secs(40);
const LATER_RETRY: Duration = Duration::from_secs(60);

/// Delay before the next attempt after `retry_count` failed retries.
pub fn next_retry_delay(retry_count: u32) -> Duration {
    match retry_count {
        1 => FIRST_RETRY,
        2 => SECOND_RETRY,
        3 => THIRD_RETRY,
        _ => LATER_RETRY,
    }
}

/// Time of the next attempt after `retry_count` failed retries.
pub fn next_retry_at(retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let delay = next_retry_delay(retry_count);
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60))
}
