//! Mock broker client
//!
//! Records every accepted message and serves one delivery report per accepted
//! message on the next pump. Queue-full and fatal responses are scripted.

use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::relay::broker::{BrokerClient, PublishStatus, Topic};
use crate::relay::error::{RelayError, RelayResult};

/// A message accepted by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: Option<Bytes>,
    pub payload: Bytes,
}

impl PublishedMessage {
    pub fn key_str(&self) -> Option<&str> {
        self.key
            .as_ref()
            .and_then(|k| std::str::from_utf8(k).ok())
    }
}

#[derive(Debug, Default)]
struct MockState {
    published: Vec<PublishedMessage>,
    queue_full_remaining: u32,
    full_after: Option<u32>,
    fail_next: Option<String>,
    fail_flush: bool,
    pending_reports: usize,
    attempts: u64,
    pumps: u64,
    flushes: u64,
}

/// In-memory [`BrokerClient`]
#[derive(Debug, Default)]
pub struct MockBroker {
    state: Mutex<MockState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a full queue for the next `attempts` publishes
    pub fn queue_full_for(&self, attempts: u32) {
        self.state.lock().queue_full_remaining = attempts;
    }

    /// Accept `accepts` more publishes, then report a full queue for good
    pub fn queue_full_after(&self, accepts: u32) {
        self.state.lock().full_after = Some(accepts);
    }

    /// Undo [`queue_full_after`](Self::queue_full_after)
    pub fn clear_queue_full(&self) {
        self.state.lock().full_after = None;
    }

    /// Reject the next publish with a non-retryable error
    pub fn fail_next(&self, reason: &str) {
        self.state.lock().fail_next = Some(reason.to_string());
    }

    /// Make every flush fail
    pub fn fail_flush(&self) {
        self.state.lock().fail_flush = true;
    }

    /// Messages accepted so far, in order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Accepted messages carrying `key`
    pub fn published_with_key(&self, key: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.key_str() == Some(key))
            .collect()
    }

    /// Publish calls made, including rejected ones
    pub fn attempts(&self) -> u64 {
        self.state.lock().attempts
    }

    pub fn pump_count(&self) -> u64 {
        self.state.lock().pumps
    }

    pub fn flush_count(&self) -> u64 {
        self.state.lock().flushes
    }
}

impl BrokerClient for MockBroker {
    fn publish(&self, topic: &Topic, key: Option<&[u8]>, payload: &[u8]) -> PublishStatus {
        let mut state = self.state.lock();
        state.attempts += 1;

        if state.queue_full_remaining > 0 {
            state.queue_full_remaining -= 1;
            return PublishStatus::QueueFull;
        }
        match state.full_after {
            Some(0) => return PublishStatus::QueueFull,
            Some(n) => state.full_after = Some(n - 1),
            None => {}
        }
        if let Some(reason) = state.fail_next.take() {
            return PublishStatus::Fatal(reason);
        }

        state.published.push(PublishedMessage {
            topic: topic.name().to_string(),
            key: key.map(Bytes::copy_from_slice),
            payload: Bytes::copy_from_slice(payload),
        });
        state.pending_reports += 1;
        PublishStatus::Accepted
    }

    fn pump(&self, _timeout: Duration) -> usize {
        let mut state = self.state.lock();
        state.pumps += 1;
        std::mem::take(&mut state.pending_reports)
    }

    fn flush(&self, _timeout: Duration) -> RelayResult<()> {
        let mut state = self.state.lock();
        state.flushes += 1;
        if state.fail_flush {
            return Err(RelayError::Broker("flush timed out".to_string()));
        }
        state.pending_reports = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_broker_scripted_queue_full() {
        let broker = MockBroker::new();
        let topic = Topic::new("t").unwrap();
        broker.queue_full_for(2);

        assert_eq!(broker.publish(&topic, None, b"x"), PublishStatus::QueueFull);
        assert_eq!(broker.publish(&topic, None, b"x"), PublishStatus::QueueFull);
        assert_eq!(broker.publish(&topic, None, b"x"), PublishStatus::Accepted);
        assert_eq!(broker.attempts(), 3);
        assert_eq!(broker.published().len(), 1);
    }

    #[test]
    fn test_mock_broker_reports_served_once() {
        let broker = MockBroker::new();
        let topic = Topic::new("t").unwrap();
        broker.publish(&topic, Some(b"trace"), b"a");

        assert_eq!(broker.pump(Duration::ZERO), 1);
        assert_eq!(broker.pump(Duration::ZERO), 0);
        assert_eq!(broker.pump_count(), 2);
        assert_eq!(broker.published_with_key("trace").len(), 1);
    }
}
