//! Broker client face
//!
//! The pipeline only needs three things from a broker client: enqueue a
//! message, pump delivery reports and flush. [`BrokerClient`] captures that
//! contract so the harvester and tests never depend on rdkafka directly.
//!
//! ## Architecture
//!
//! ```text
//! Publisher ──> BrokerClient ──> KafkaBroker (rdkafka BaseProducer)
//!                              └─> MockBroker (tests)
//!
//! daemon ──> TraceConsumer (rdkafka BaseConsumer) ──> interpreter stdin
//! ```

pub mod config;
pub mod consumer;
pub mod producer;

use std::time::Duration;

use crate::relay::error::{RelayError, RelayResult};

pub use config::{BrokerConfig, OffsetReset, SecurityMode, StartOffset, TlsMaterial};
pub use consumer::{Inbound, TraceConsumer};
pub use producer::{DeliveryStats, KafkaBroker, KafkaBrokerBuilder};

/// Longest topic name Kafka accepts
const MAX_TOPIC_NAME_LEN: usize = 249;

/// Result of handing one message to the broker client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishStatus {
    /// Queued for asynchronous delivery
    Accepted,
    /// The client's delivery queue is full; pump and retry
    QueueFull,
    /// Any other failure; the message was not queued
    Fatal(String),
}

/// Producer side of a broker client
pub trait BrokerClient: Send + Sync {
    /// Enqueue one message for asynchronous delivery
    fn publish(&self, topic: &Topic, key: Option<&[u8]>, payload: &[u8]) -> PublishStatus;

    /// Serve delivery reports for up to `timeout`; returns how many were served
    fn pump(&self, timeout: Duration) -> usize;

    /// Wait up to `timeout` for every queued message to be delivered
    fn flush(&self, timeout: Duration) -> RelayResult<()>;
}

/// Validated destination topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    /// Validate a topic name
    ///
    /// Kafka accepts ASCII alphanumerics, `.`, `_` and `-`, up to 249 chars.
    pub fn new(name: &str) -> RelayResult<Self> {
        if name.is_empty() || name.len() > MAX_TOPIC_NAME_LEN {
            return Err(RelayError::InvalidConfig(format!(
                "topic name must be 1..={} characters, got {}",
                MAX_TOPIC_NAME_LEN,
                name.len()
            )));
        }
        if name == "." || name == ".." {
            return Err(RelayError::InvalidConfig(format!(
                "topic name '{}' is reserved",
                name
            )));
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(RelayError::InvalidConfig(format!(
                "topic name '{}' contains invalid character '{}'",
                name, bad
            )));
        }
        Ok(Topic(name.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
