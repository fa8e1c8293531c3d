//! Input-topic consumer for the user-space face
//!
//! Reads keyed trace frames from partition 0 of the input topic. Every
//! message is classified before it reaches the interpreter: only messages
//! carrying the trace key and a non-empty payload are passed on.

use std::time::Duration;

use bytes::Bytes;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::TopicPartitionList;
use tracing::debug;

use super::config::BrokerConfig;
use super::Topic;
use crate::relay::constants::{INPUT_PARTITION, TRACE_KEY};
use crate::relay::error::{RelayError, RelayResult};

/// Why an inbound message was not passed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    MissingKey,
    ForeignKey,
    EmptyPayload,
    EndOfPartition,
}

/// Outcome of one consumer poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A trace frame to hand to the interpreter
    Trace(Bytes),
    /// A message or event that carries no trace data
    Ignored(IgnoreReason),
    /// Nothing arrived within the poll interval
    Idle,
}

/// Classify a message by its key and payload
pub fn classify(key: Option<&[u8]>, payload: Option<&[u8]>) -> Inbound {
    match key {
        None => return Inbound::Ignored(IgnoreReason::MissingKey),
        Some(k) if k != TRACE_KEY.as_bytes() => {
            return Inbound::Ignored(IgnoreReason::ForeignKey)
        }
        Some(_) => {}
    }

    match payload {
        Some(p) if !p.is_empty() => Inbound::Trace(Bytes::copy_from_slice(p)),
        _ => Inbound::Ignored(IgnoreReason::EmptyPayload),
    }
}

/// Consumer of keyed trace frames
pub struct TraceConsumer {
    consumer: BaseConsumer,
    topic: Topic,
}

impl TraceConsumer {
    /// Create a consumer assigned to partition 0 of `topic`
    pub fn new(config: &BrokerConfig, topic: Topic) -> RelayResult<Self> {
        if !config.is_configured() {
            return Err(RelayError::InvalidConfig(
                "bootstrap.servers is empty".to_string(),
            ));
        }

        let consumer: BaseConsumer = config
            .consumer_config()
            .create()
            .map_err(|e| RelayError::Broker(format!("Failed to create consumer: {}", e)))?;

        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(
            topic.name(),
            INPUT_PARTITION,
            config.start_offset.to_offset(),
        )?;
        consumer.assign(&assignment)?;

        debug!(
            topic = %topic,
            start = ?config.start_offset,
            group = config.effective_group_id(),
            "Assigned input topic"
        );

        Ok(Self { consumer, topic })
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Wait up to `timeout` for the next inbound message
    pub fn poll(&self, timeout: Duration) -> RelayResult<Inbound> {
        match self.consumer.poll(timeout) {
            None => Ok(Inbound::Idle),
            Some(Err(KafkaError::PartitionEOF(partition))) => {
                debug!(partition, "Reached end of input partition");
                Ok(Inbound::Ignored(IgnoreReason::EndOfPartition))
            }
            Some(Err(e)) => Err(RelayError::Broker(format!("Consume failed: {}", e))),
            Some(Ok(message)) => {
                let inbound = classify(message.key(), message.payload());
                if let Inbound::Ignored(reason) = inbound {
                    debug!(
                        offset = message.offset(),
                        ?reason,
                        "Ignoring inbound message"
                    );
                }
                Ok(inbound)
            }
        }
    }
}

impl std::fmt::Debug for TraceConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceConsumer")
            .field("topic", &self.topic)
            .finish()
    }
}
