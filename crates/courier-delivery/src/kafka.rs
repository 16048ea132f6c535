//! Kafka broker client built on `rdkafka`.
//!
//! Uses an idempotent `FutureProducer` with `acks=all`. The event id and trace
//! id travel as message headers next to any headers on the envelope.

use rdkafka::{
    config::ClientConfig,
    error::{KafkaError, RDKafkaErrorCode},
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    broker::{BrokerClient, BrokerError, BrokerErrorKind, BrokerRecord, RecordMetadata, SendFuture},
    error::{DeliveryError, Result},
};

/// Header carrying the event id.
pub const EVENT_ID_HEADER: &str = "event_id";

/// Header carrying the trace id.
pub const TRACE_ID_HEADER: &str = "trace_id";

/// Producer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated `host:port` list.
    pub bootstrap_servers: String,
    /// Client id reported to the brokers.
    pub client_id: String,
    /// Required acknowledgements.
    pub acks: String,
    /// Idempotent producer.
    pub enable_idempotence: bool,
    /// Producer-level retries before a send fails.
    pub retries: u32,
    /// Batching delay.
    pub linger_ms: u32,
    /// Broker request timeout.
    pub request_timeout_ms: u32,
    /// Upper bound on the time from send to acknowledgement.
    pub delivery_timeout_ms: u32,
    /// Compression codec.
    pub compression: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "courier".to_string(),
            acks: "all".to_string(),
            enable_idempotence: true,
            retries: 5,
            linger_ms: 5,
            request_timeout_ms: 60_000,
            delivery_timeout_ms: 360_000,
            compression: "snappy".to_string(),
        }
    }
}

impl KafkaConfig {
    /// librdkafka properties for this configuration.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id)
            .set("acks", &self.acks)
            .set("enable.idempotence", self.enable_idempotence.to_string())
            .set("retries", self.retries.to_string())
            .set("linger.ms", self.linger_ms.to_string())
            .set("request.timeout.ms", self.request_timeout_ms.to_string())
            .set("delivery.timeout.ms", self.delivery_timeout_ms.to_string())
            .set("compression.type", &self.compression);
        config
    }
}

/// `BrokerClient` over a Kafka `FutureProducer`.
#[derive(Clone)]
pub struct KafkaBrokerClient {
    producer: FutureProducer,
}

impl KafkaBrokerClient {
    /// Creates the producer.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if librdkafka rejects the
    /// configuration.
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = config.client_config().create().map_err(|e| {
            DeliveryError::configuration(format!("failed to create Kafka producer: {e}"))
        })?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            client_id = %config.client_id,
            acks = %config.acks,
            "kafka producer created"
        );
        Ok(Self { producer })
    }

    /// Wraps an existing producer.
    pub fn from_producer(producer: FutureProducer) -> Self {
        Self { producer }
    }
}

impl BrokerClient for KafkaBrokerClient {
    fn send(&self, record: BrokerRecord<'_>) -> std::result::Result<SendFuture, BrokerError> {
        let envelope = record.envelope;
        let mut headers = OwnedHeaders::new()
            .insert(Header { key: EVENT_ID_HEADER, value: Some(envelope.event_id().as_str()) })
            .insert(Header { key: TRACE_ID_HEADER, value: Some(envelope.trace_id()) });
        for (name, value) in envelope.headers() {
            headers = headers.insert(Header { key: name.as_str(), value: Some(value.as_str()) });
        }

        let mut kafka_record = FutureRecord::to(record.topic)
            .key(record.key)
            .payload(envelope.value())
            .headers(headers);
        if let Some(partition) = record.partition {
            kafka_record = kafka_record.partition(partition);
        }

        let delivery =
            self.producer.send_result(kafka_record).map_err(|(error, _)| broker_error(&error))?;

        Ok(Box::pin(async move {
            match delivery.await {
                Ok(Ok((partition, offset))) => Ok(RecordMetadata { partition, offset }),
                Ok(Err((error, _message))) => Err(broker_error(&error)),
                Err(_canceled) => Err(BrokerError::connection(
                    "producer dropped before the delivery report arrived",
                )),
            }
        }))
    }
}

/// Maps an rdkafka error to a broker error.
pub fn broker_error(error: &KafkaError) -> BrokerError {
    let code = error.rdkafka_error_code();
    let kind = code.map_or(BrokerErrorKind::Unknown, error_kind);

    let broker_error = BrokerError::new(kind, error.to_string());
    match code {
        Some(code) => broker_error.with_detail(format!("{code:?}")),
        None => broker_error,
    }
}

/// Closed error kind for an rdkafka error code.
pub fn error_kind(code: RDKafkaErrorCode) -> BrokerErrorKind {
    match code {
        RDKafkaErrorCode::MessageTimedOut | RDKafkaErrorCode::RequestTimedOut => {
            BrokerErrorKind::Timeout
        },
        RDKafkaErrorCode::BrokerTransportFailure
        | RDKafkaErrorCode::AllBrokersDown
        | RDKafkaErrorCode::NetworkException => BrokerErrorKind::Connection,
        RDKafkaErrorCode::Resolve => BrokerErrorKind::UnknownHost,
        RDKafkaErrorCode::NotEnoughReplicas => BrokerErrorKind::NotEnoughReplicas,
        RDKafkaErrorCode::NotEnoughReplicasAfterAppend => {
            BrokerErrorKind::NotEnoughReplicasAfterAppend
        },
        RDKafkaErrorCode::QueueFull => BrokerErrorKind::QueueFull,
        RDKafkaErrorCode::MessageSizeTooLarge => BrokerErrorKind::RecordTooLarge,
        RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic => {
            BrokerErrorKind::UnknownTopic
        },
        RDKafkaErrorCode::TopicAuthorizationFailed
        | RDKafkaErrorCode::ClusterAuthorizationFailed => BrokerErrorKind::Authorization,
        RDKafkaErrorCode::InvalidRecord | RDKafkaErrorCode::InvalidMessage => {
            BrokerErrorKind::InvalidRecord
        },
        RDKafkaErrorCode::BadMessage => BrokerErrorKind::Serialization,
        _ => BrokerErrorKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_producer_settings() {
        let config = KafkaConfig::default().client_config();
        assert_eq!(config.get("acks"), Some("all"));
        assert_eq!(config.get("enable.idempotence"), Some("true"));
        assert_eq!(config.get("retries"), Some("5"));
        assert_eq!(config.get("delivery.timeout.ms"), Some("360000"));
        assert_eq!(config.get("compression.type"), Some("snappy"));
    }

    #[test]
    fn transient_codes_map_to_transient_kinds() {
        assert_eq!(error_kind(RDKafkaErrorCode::MessageTimedOut), BrokerErrorKind::Timeout);
        assert_eq!(error_kind(RDKafkaErrorCode::AllBrokersDown), BrokerErrorKind::Connection);
        assert!(error_kind(RDKafkaErrorCode::NotEnoughReplicas).is_transient());
        assert!(error_kind(RDKafkaErrorCode::QueueFull).is_transient());
    }

    #[test]
    fn permanent_codes_map_to_permanent_kinds() {
        assert_eq!(
            error_kind(RDKafkaErrorCode::MessageSizeTooLarge),
            BrokerErrorKind::RecordTooLarge
        );
        assert!(!error_kind(RDKafkaErrorCode::TopicAuthorizationFailed).is_transient());
        assert_eq!(error_kind(RDKafkaErrorCode::InvalidRecord), BrokerErrorKind::InvalidRecord);
    }

    #[test]
    fn production_errors_keep_code_as_detail() {
        let error =
            broker_error(&KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut));
        assert_eq!(error.kind, BrokerErrorKind::Timeout);
        assert_eq!(error.detail.as_deref(), Some("MessageTimedOut"));
    }
}
