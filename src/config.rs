//! Configuration management for the Courier service.

use std::time::Duration;

use anyhow::{Context, Result};
use courier_delivery::{
    circuit::CircuitConfig, retention::RetentionPolicy, BrokerErrorKind, ClassifierConfig,
    FailureClassifier, RecoveryConfig,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.toml";

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`config.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// List settings such as `RETRYABLE_ERRORS` take bracketed values in the
/// environment, for example `RETRYABLE_ERRORS=[connection,timeout]`.
///
/// # Example
///
/// ```no_run
/// use courier::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("recovering {} dead letters per page", config.recovery_batch_size);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,

    // Kafka
    /// Comma-separated broker list.
    ///
    /// Environment variable: `KAFKA_BOOTSTRAP_SERVERS`
    #[serde(default = "default_bootstrap_servers", alias = "KAFKA_BOOTSTRAP_SERVERS")]
    pub kafka_bootstrap_servers: String,
    /// Producer client id.
    ///
    /// Environment variable: `KAFKA_CLIENT_ID`
    #[serde(default = "default_client_id", alias = "KAFKA_CLIENT_ID")]
    pub kafka_client_id: String,
    /// Required acknowledgements.
    ///
    /// Environment variable: `KAFKA_ACKS`
    #[serde(default = "default_acks", alias = "KAFKA_ACKS")]
    pub kafka_acks: String,
    /// Idempotent producer.
    ///
    /// Environment variable: `KAFKA_ENABLE_IDEMPOTENCE`
    #[serde(default = "default_enable_idempotence", alias = "KAFKA_ENABLE_IDEMPOTENCE")]
    pub kafka_enable_idempotence: bool,
    /// Producer-level retries.
    ///
    /// Environment variable: `KAFKA_RETRIES`
    #[serde(default = "default_kafka_retries", alias = "KAFKA_RETRIES")]
    pub kafka_retries: u32,
    /// Batching delay in milliseconds.
    ///
    /// Environment variable: `KAFKA_LINGER_MS`
    #[serde(default = "default_linger_ms", alias = "KAFKA_LINGER_MS")]
    pub kafka_linger_ms: u32,
    /// Broker request timeout in milliseconds.
    ///
    /// Environment variable: `KAFKA_REQUEST_TIMEOUT_MS`
    #[serde(default = "default_request_timeout_ms", alias = "KAFKA_REQUEST_TIMEOUT_MS")]
    pub kafka_request_timeout_ms: u32,
    /// Upper bound on send-to-acknowledgement time in milliseconds.
    ///
    /// Environment variable: `KAFKA_DELIVERY_TIMEOUT_MS`
    #[serde(default = "default_delivery_timeout_ms", alias = "KAFKA_DELIVERY_TIMEOUT_MS")]
    pub kafka_delivery_timeout_ms: u32,
    /// Compression codec.
    ///
    /// Environment variable: `KAFKA_COMPRESSION`
    #[serde(default = "default_compression", alias = "KAFKA_COMPRESSION")]
    pub kafka_compression: String,

    // Publishing
    /// Wait for a broker acknowledgement in milliseconds.
    ///
    /// Environment variable: `PUBLISH_TIMEOUT_MS`
    #[serde(default = "default_publish_timeout_ms", alias = "PUBLISH_TIMEOUT_MS")]
    pub publish_timeout_ms: u64,

    // Recovery
    /// Pause between recovery ticks in milliseconds.
    ///
    /// Environment variable: `RECOVERY_FIXED_DELAY_MS`
    #[serde(default = "default_fixed_delay_ms", alias = "RECOVERY_FIXED_DELAY_MS")]
    pub recovery_fixed_delay_ms: u64,
    /// Dead letters per recovery page.
    ///
    /// Environment variable: `RECOVERY_BATCH_SIZE`
    #[serde(default = "default_batch_size", alias = "RECOVERY_BATCH_SIZE")]
    pub recovery_batch_size: usize,
    /// Failed retries before a dead letter is abandoned.
    ///
    /// Environment variable: `RECOVERY_MAX_RETRY`
    #[serde(default = "default_max_retry", alias = "RECOVERY_MAX_RETRY")]
    pub recovery_max_retry: u32,

    // Circuit breaker
    /// Consecutive failed ticks that open the recovery circuit.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_THRESHOLD`
    #[serde(default = "default_circuit_threshold", alias = "CIRCUIT_BREAKER_THRESHOLD")]
    pub circuit_breaker_threshold: u32,
    /// Per-tick failure rate (above 0.0, at most 1.0) that counts as a failed tick.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_FAILURE_RATE`
    #[serde(default = "default_failure_rate", alias = "CIRCUIT_BREAKER_FAILURE_RATE")]
    pub circuit_breaker_failure_rate: f64,

    // Classification
    /// Error kinds retried automatically.
    ///
    /// Environment variable: `RETRYABLE_ERRORS`
    #[serde(default = "default_retryable_errors", alias = "RETRYABLE_ERRORS")]
    pub retryable_errors: Vec<BrokerErrorKind>,
    /// Error kinds never retried.
    ///
    /// Environment variable: `NON_RETRYABLE_ERRORS`
    #[serde(default = "default_non_retryable_errors", alias = "NON_RETRYABLE_ERRORS")]
    pub non_retryable_errors: Vec<BrokerErrorKind>,

    // Retention
    /// Days recovered dead letters are kept. Zero keeps them forever.
    ///
    /// Environment variable: `RECOVERED_RETENTION_DAYS`
    #[serde(default = "default_retention_days", alias = "RECOVERED_RETENTION_DAYS")]
    pub recovered_retention_days: u32,
    /// Seconds between retention sweeps.
    ///
    /// Environment variable: `RETENTION_SWEEP_INTERVAL_SECONDS`
    #[serde(default = "default_sweep_interval", alias = "RETENTION_SWEEP_INTERVAL_SECONDS")]
    pub retention_sweep_interval_seconds: u64,

    // Scheduler lease
    /// Take a database lease before each recovery tick.
    ///
    /// Environment variable: `SCHEDULER_LEASE_ENABLED`
    #[serde(default = "default_lease_enabled", alias = "SCHEDULER_LEASE_ENABLED")]
    pub scheduler_lease_enabled: bool,
    /// Lease lifetime in seconds.
    ///
    /// Environment variable: `SCHEDULER_LEASE_TTL_SECONDS`
    #[serde(default = "default_lease_ttl", alias = "SCHEDULER_LEASE_TTL_SECONDS")]
    pub scheduler_lease_ttl_seconds: u64,

    // Lifecycle
    /// Maximum wait for background tasks on shutdown, in seconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Logging
    /// Log filter.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result is
    /// invalid.
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    /// The layered sources `load` reads.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""))
    }

    /// Extracts and validates configuration from `figment`.
    ///
    /// # Errors
    ///
    /// Returns an error if extraction fails or the result is invalid.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the recovery engine configuration.
    pub fn to_recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            fixed_delay: Duration::from_millis(self.recovery_fixed_delay_ms),
            batch_size: self.recovery_batch_size,
            max_retry: self.recovery_max_retry,
            circuit: CircuitConfig {
                threshold: self.circuit_breaker_threshold,
                failure_rate_threshold: self.circuit_breaker_failure_rate,
            },
            retention: self.to_retention_policy(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// Convert to the retention policy. Zero days disables purging.
    pub fn to_retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            recovered_ttl: Duration::from_secs(
                u64::from(self.recovered_retention_days) * SECONDS_PER_DAY,
            ),
            sweep_interval: Duration::from_secs(self.retention_sweep_interval_seconds),
        }
    }

    /// Convert to the classifier's error-kind sets.
    pub fn to_classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            retryable: self.retryable_errors.clone(),
            non_retryable: self.non_retryable_errors.clone(),
        }
    }

    /// Build the failure classifier.
    pub fn to_classifier(&self) -> FailureClassifier {
        FailureClassifier::new(&self.to_classifier_config())
    }

    /// Convert to producer settings.
    #[cfg(feature = "kafka")]
    pub fn to_kafka_config(&self) -> courier_delivery::kafka::KafkaConfig {
        courier_delivery::kafka::KafkaConfig {
            bootstrap_servers: self.kafka_bootstrap_servers.clone(),
            client_id: self.kafka_client_id.clone(),
            acks: self.kafka_acks.clone(),
            enable_idempotence: self.kafka_enable_idempotence,
            retries: self.kafka_retries,
            linger_ms: self.kafka_linger_ms,
            request_timeout_ms: self.kafka_request_timeout_ms,
            delivery_timeout_ms: self.kafka_delivery_timeout_ms,
            compression: self.kafka_compression.clone(),
        }
    }

    /// Acknowledgement wait for a single publish.
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Scheduler lease lifetime.
    pub fn scheduler_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.scheduler_lease_ttl_seconds)
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                // a colon right after the scheme means there is no password
                if !self.database_url[..colon_pos].ends_with("postgresql")
                    && !self.database_url[..colon_pos].ends_with("postgres")
                {
                    let mut masked = self.database_url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        if self.kafka_bootstrap_servers.trim().is_empty() {
            anyhow::bail!("kafka_bootstrap_servers must not be empty");
        }

        if self.publish_timeout_ms == 0 {
            anyhow::bail!("publish_timeout_ms must be greater than 0");
        }

        if self.recovery_fixed_delay_ms == 0 {
            anyhow::bail!("recovery_fixed_delay_ms must be greater than 0");
        }

        if self.recovery_batch_size == 0 {
            anyhow::bail!("recovery_batch_size must be greater than 0");
        }

        if self.recovery_max_retry == 0 {
            anyhow::bail!("recovery_max_retry must be greater than 0");
        }

        if self.circuit_breaker_threshold == 0 {
            anyhow::bail!("circuit_breaker_threshold must be greater than 0");
        }

        let rate = self.circuit_breaker_failure_rate;
        if !(rate > 0.0 && rate <= 1.0) {
            anyhow::bail!("circuit_breaker_failure_rate must be above 0.0 and at most 1.0");
        }

        if self.recovered_retention_days > 0 && self.retention_sweep_interval_seconds == 0 {
            anyhow::bail!("retention_sweep_interval_seconds must be greater than 0");
        }

        if self.scheduler_lease_enabled && self.scheduler_lease_ttl_seconds == 0 {
            anyhow::bail!("scheduler_lease_ttl_seconds must be greater than 0");
        }

        if self.shutdown_timeout_seconds == 0 {
            anyhow::bail!("shutdown_timeout_seconds must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            kafka_bootstrap_servers: default_bootstrap_servers(),
            kafka_client_id: default_client_id(),
            kafka_acks: default_acks(),
            kafka_enable_idempotence: default_enable_idempotence(),
            kafka_retries: default_kafka_retries(),
            kafka_linger_ms: default_linger_ms(),
            kafka_request_timeout_ms: default_request_timeout_ms(),
            kafka_delivery_timeout_ms: default_delivery_timeout_ms(),
            kafka_compression: default_compression(),
            publish_timeout_ms: default_publish_timeout_ms(),
            recovery_fixed_delay_ms: default_fixed_delay_ms(),
            recovery_batch_size: default_batch_size(),
            recovery_max_retry: default_max_retry(),
            circuit_breaker_threshold: default_circuit_threshold(),
            circuit_breaker_failure_rate: default_failure_rate(),
            retryable_errors: default_retryable_errors(),
            non_retryable_errors: default_non_retryable_errors(),
            recovered_retention_days: default_retention_days(),
            retention_sweep_interval_seconds: default_sweep_interval(),
            scheduler_lease_enabled: default_lease_enabled(),
            scheduler_lease_ttl_seconds: default_lease_ttl(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/courier".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "courier".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_enable_idempotence() -> bool {
    true
}

fn default_kafka_retries() -> u32 {
    5
}

fn default_linger_ms() -> u32 {
    5
}

fn default_request_timeout_ms() -> u32 {
    60_000
}

fn default_delivery_timeout_ms() -> u32 {
    360_000
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_publish_timeout_ms() -> u64 {
    courier_delivery::DEFAULT_PUBLISH_TIMEOUT_MS
}

fn default_fixed_delay_ms() -> u64 {
    courier_delivery::DEFAULT_FIXED_DELAY_MS
}

fn default_batch_size() -> usize {
    courier_delivery::DEFAULT_BATCH_SIZE
}

fn default_max_retry() -> u32 {
    courier_delivery::DEFAULT_MAX_RETRY
}

fn default_circuit_threshold() -> u32 {
    courier_delivery::DEFAULT_CIRCUIT_BREAKER_THRESHOLD
}

fn default_failure_rate() -> f64 {
    courier_delivery::DEFAULT_FAILURE_RATE_THRESHOLD
}

fn default_retryable_errors() -> Vec<BrokerErrorKind> {
    ClassifierConfig::default().retryable
}

fn default_non_retryable_errors() -> Vec<BrokerErrorKind> {
    ClassifierConfig::default().non_retryable
}

fn default_retention_days() -> u32 {
    courier_delivery::DEFAULT_RECOVERED_RETENTION_DAYS
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_lease_enabled() -> bool {
    true
}

fn default_lease_ttl() -> u64 {
    300
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info,courier=debug".to_string()
}
