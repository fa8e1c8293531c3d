//! rdkafka-backed broker client
//!
//! Wraps a `BaseProducer` so delivery reports are served only when the
//! pipeline pumps them. A queue-full rejection is surfaced as
//! [`PublishStatus::QueueFull`] rather than an error; the publisher owns the
//! retry policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rdkafka::client::ClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use rdkafka::util::Timeout;
use tracing::{debug, warn};

use super::config::{BrokerConfig, SecurityMode};
use super::{BrokerClient, PublishStatus, Topic};
use crate::relay::constants::DEFAULT_FLUSH_TIMEOUT_MS;
use crate::relay::error::{RelayError, RelayResult};

/// Delivery report counters
#[derive(Debug, Default)]
pub struct DeliveryStats {
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl DeliveryStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Reports served so far, successful or not
    pub fn served(&self) -> u64 {
        self.delivered() + self.failed()
    }
}

/// Producer context counting delivery reports
pub struct DeliveryTracker {
    stats: Arc<DeliveryStats>,
}

impl ClientContext for DeliveryTracker {}

impl ProducerContext for DeliveryTracker {
    type DeliveryOpaque = ();

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, _opaque: Self::DeliveryOpaque) {
        match delivery_result {
            Ok(_) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err((err, message)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    topic = message.topic(),
                    error = %err,
                    "Message delivery failed"
                );
            }
        }
    }
}

/// Broker client publishing through librdkafka
pub struct KafkaBroker {
    producer: BaseProducer<DeliveryTracker>,
    stats: Arc<DeliveryStats>,
    config: Arc<BrokerConfig>,
    flush_timeout: Duration,
}

impl KafkaBroker {
    /// Create a producer from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the bootstrap servers are not configured or the
    /// rdkafka producer cannot be created.
    pub fn new(config: Arc<BrokerConfig>) -> RelayResult<Self> {
        if !config.is_configured() {
            return Err(RelayError::InvalidConfig(
                "bootstrap.servers is empty".to_string(),
            ));
        }

        let stats = Arc::new(DeliveryStats::default());
        let tracker = DeliveryTracker {
            stats: Arc::clone(&stats),
        };

        let producer: BaseProducer<DeliveryTracker> = config
            .producer_config()
            .create_with_context(tracker)
            .map_err(|e| RelayError::Broker(format!("Failed to create producer: {}", e)))?;

        debug!(
            bootstrap_servers = %config.bootstrap_servers,
            security = config.security.as_str(),
            "Created broker producer"
        );

        Ok(Self {
            producer,
            stats,
            config,
            flush_timeout: Duration::from_millis(DEFAULT_FLUSH_TIMEOUT_MS),
        })
    }

    /// Delivery report counters
    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    /// Messages queued but not yet acknowledged
    pub fn in_flight(&self) -> i32 {
        self.producer.in_flight_count()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

impl BrokerClient for KafkaBroker {
    fn publish(&self, topic: &Topic, key: Option<&[u8]>, payload: &[u8]) -> PublishStatus {
        let mut record: BaseRecord<'_, [u8], [u8]> = BaseRecord::to(topic.name()).payload(payload);
        if let Some(k) = key {
            record = record.key(k);
        }

        match self.producer.send(record) {
            Ok(()) => PublishStatus::Accepted,
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                PublishStatus::QueueFull
            }
            Err((err, _)) => PublishStatus::Fatal(err.to_string()),
        }
    }

    fn pump(&self, timeout: Duration) -> usize {
        let before = self.stats.served();
        self.producer.poll(timeout);
        (self.stats.served() - before) as usize
    }

    fn flush(&self, timeout: Duration) -> RelayResult<()> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| RelayError::Broker(format!("Flush failed: {}", e)))
    }
}

impl Drop for KafkaBroker {
    fn drop(&mut self) {
        if let Err(e) = self.flush(self.flush_timeout) {
            warn!(
                in_flight = self.in_flight(),
                error = %e,
                "Undelivered messages dropped with the producer"
            );
        }
    }
}

impl std::fmt::Debug for KafkaBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaBroker")
            .field("bootstrap_servers", &self.config.bootstrap_servers)
            .field("security", &self.config.security.as_str())
            .finish()
    }
}

/// Builder for creating a KafkaBroker with custom settings
pub struct KafkaBrokerBuilder {
    config: BrokerConfig,
    flush_timeout: Duration,
}

impl KafkaBrokerBuilder {
    /// Create a new builder with the given bootstrap servers
    pub fn new(bootstrap_servers: &str) -> Self {
        Self {
            config: BrokerConfig::new(bootstrap_servers),
            flush_timeout: Duration::from_millis(DEFAULT_FLUSH_TIMEOUT_MS),
        }
    }

    /// Start from an existing configuration
    pub fn from_config(config: BrokerConfig) -> Self {
        Self {
            config,
            flush_timeout: Duration::from_millis(DEFAULT_FLUSH_TIMEOUT_MS),
        }
    }

    /// Set the transport security
    pub fn security(mut self, security: SecurityMode) -> Self {
        self.config.security = security;
        self
    }

    /// Set the client id
    pub fn client_id(mut self, client_id: &str) -> Self {
        self.config.client_id = client_id.to_string();
        self
    }

    /// Set linger time in milliseconds
    pub fn linger_ms(mut self, ms: u32) -> Self {
        self.config.linger_ms = ms;
        self
    }

    /// Set the largest frame the producer must accept
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Set the bounded flush performed when the producer is dropped
    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Build the KafkaBroker
    pub fn build(self) -> RelayResult<KafkaBroker> {
        let mut broker = KafkaBroker::new(Arc::new(self.config))?;
        broker.flush_timeout = self.flush_timeout;
        Ok(broker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kafka_broker_no_bootstrap_servers() {
        let result = KafkaBroker::new(Arc::new(BrokerConfig::default()));
        assert!(matches!(result, Err(RelayError::InvalidConfig(_))));
    }

    #[test]
    fn test_kafka_broker_builder() {
        let builder = KafkaBrokerBuilder::new("kafka1:9092,kafka2:9092")
            .client_id("relay-7")
            .linger_ms(25)
            .mtu(4096)
            .flush_timeout(Duration::from_millis(500));

        assert_eq!(builder.config.bootstrap_servers, "kafka1:9092,kafka2:9092");
        assert_eq!(builder.config.client_id, "relay-7");
        assert_eq!(builder.config.linger_ms, 25);
        assert_eq!(builder.config.mtu, 4096);
        assert_eq!(builder.flush_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_kafka_broker_builder_defaults() {
        let builder = KafkaBrokerBuilder::new("kafka:9092");
        assert_eq!(builder.config.security, SecurityMode::Plaintext);
        assert_eq!(builder.config.compression, "gzip");
        assert_eq!(
            builder.flush_timeout,
            Duration::from_millis(DEFAULT_FLUSH_TIMEOUT_MS)
        );
    }

    #[test]
    fn test_delivery_stats_served() {
        let stats = DeliveryStats::default();
        stats.delivered.fetch_add(3, Ordering::Relaxed);
        stats.failed.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.served(), 4);
    }

    #[test]
    fn test_kafka_broker_created_without_connecting() {
        // librdkafka connects lazily, so creation succeeds without a broker
        let broker = KafkaBrokerBuilder::new("127.0.0.1:1")
            .client_id(crate::relay::constants::TEST_CLIENT_ID)
            .flush_timeout(Duration::from_millis(10))
            .build()
            .expect("producer creation should not need a live broker");
        assert_eq!(broker.in_flight(), 0);
        assert_eq!(broker.pump(Duration::from_millis(0)), 0);
    }
}
