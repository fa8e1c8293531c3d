//! Frame publisher
//!
//! Hands frames to a [`BrokerClient`] and owns the backpressure protocol:
//! when the client's delivery queue is full the publisher pumps delivery
//! reports (bounded wait) and retries the same frame. Retrying stops only when
//! the caller's [`StopSignal`] fires, never after a fixed attempt count.
//!
//! Any other broker failure drops the frame; nothing is buffered across such
//! failures. Frames left over when the stop signal fires are handed back to
//! the caller, which either retries them or records them as abandoned.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::broker::{BrokerClient, PublishStatus, Topic};
use super::error::RelayResult;
use super::source::Frame;

/// Tells a blocking retry loop when to give up
pub trait StopSignal {
    fn should_stop(&self) -> bool;
}

/// Never stops; the retry loop runs until the frame is accepted
#[derive(Debug, Clone, Copy, Default)]
pub struct Never;

impl StopSignal for Never {
    fn should_stop(&self) -> bool {
        false
    }
}

/// Stops once a point in time has passed
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Deadline(Instant::now() + timeout)
    }
}

impl StopSignal for Deadline {
    fn should_stop(&self) -> bool {
        Instant::now() >= self.0
    }
}

/// Outcome of publishing one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The frame was queued for delivery after `pumps` queue-full pumps
    Enqueued { pumps: u32 },
    /// The queue stayed full until the stop signal fired; the frame was not queued
    Retry,
    /// The broker rejected the frame; it was dropped
    Fatal(String),
}

/// Running publisher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub abandoned: u64,
    pub queue_full_pumps: u64,
    pub reports: u64,
}

/// What happened to one cycle's frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub enqueued: usize,
    pub dropped: usize,
    /// Frames at the tail of the batch that were never enqueued
    pub pending: usize,
    pub reports: usize,
}

impl CycleOutcome {
    /// The unpublished tail of `frames`, in order
    pub fn unpublished<'a>(&self, frames: &'a [Frame]) -> &'a [Frame] {
        &frames[frames.len() - self.pending..]
    }
}

/// Publishes frames to one topic
pub struct Publisher {
    broker: Arc<dyn BrokerClient>,
    topic: Topic,
    pump_timeout: Duration,
    stats: PublisherStats,
}

impl Publisher {
    /// Create a publisher for `topic`
    ///
    /// `pump_timeout` bounds each delivery-report pump while the queue is full.
    pub fn new(broker: Arc<dyn BrokerClient>, topic: Topic, pump_timeout: Duration) -> Self {
        Self {
            broker,
            topic,
            pump_timeout,
            stats: PublisherStats::default(),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats
    }

    /// Publish a keyed frame
    pub fn publish_frame(&mut self, frame: &Frame, stop: &dyn StopSignal) -> PublishOutcome {
        self.publish(Some(frame.key.as_bytes()), &frame.payload, stop)
    }

    /// Publish one payload, pumping and retrying while the queue is full
    pub fn publish(
        &mut self,
        key: Option<&[u8]>,
        payload: &[u8],
        stop: &dyn StopSignal,
    ) -> PublishOutcome {
        let mut pumps = 0u32;

        loop {
            match self.broker.publish(&self.topic, key, payload) {
                PublishStatus::Accepted => {
                    self.stats.enqueued += 1;
                    if pumps > 0 {
                        debug!(topic = %self.topic, pumps, "Frame enqueued after backpressure");
                    }
                    return PublishOutcome::Enqueued { pumps };
                }
                PublishStatus::QueueFull => {
                    pumps += 1;
                    self.stats.queue_full_pumps += 1;
                    self.stats.reports += self.broker.pump(self.pump_timeout) as u64;

                    if stop.should_stop() {
                        debug!(
                            topic = %self.topic,
                            len = payload.len(),
                            pumps,
                            "Delivery queue still full at stop; frame not enqueued"
                        );
                        return PublishOutcome::Retry;
                    }
                }
                PublishStatus::Fatal(reason) => {
                    self.stats.dropped += 1;
                    warn!(
                        topic = %self.topic,
                        len = payload.len(),
                        error = %reason,
                        "Failed to publish frame; dropping it"
                    );
                    return PublishOutcome::Fatal(reason);
                }
            }
        }
    }

    /// Publish one cycle's frames in order, then pump delivery reports
    ///
    /// Once the stop signal ends a retry, the frame being retried and the
    /// rest of the batch are reported as `pending` without further attempts.
    /// They are not counted as abandoned until the caller calls [`abandon`].
    ///
    /// [`abandon`]: Publisher::abandon
    pub fn publish_cycle(&mut self, frames: &[Frame], stop: &dyn StopSignal) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();

        for (i, frame) in frames.iter().enumerate() {
            match self.publish_frame(frame, stop) {
                PublishOutcome::Enqueued { .. } => outcome.enqueued += 1,
                PublishOutcome::Fatal(_) => outcome.dropped += 1,
                PublishOutcome::Retry => {
                    outcome.pending = frames.len() - i;
                    break;
                }
            }
        }

        outcome.reports = self.pump_reports();
        outcome
    }

    /// Give up on `count` frames that were never enqueued
    pub fn abandon(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        self.stats.abandoned += count as u64;
        warn!(
            topic = %self.topic,
            count,
            "Delivery queue still full at stop; frames abandoned"
        );
    }

    /// Serve pending delivery reports without blocking
    ///
    /// Called once per pipeline cycle whether or not anything was published.
    pub fn pump_reports(&mut self) -> usize {
        let served = self.broker.pump(Duration::ZERO);
        self.stats.reports += served as u64;
        served
    }

    /// Wait (bounded) for every queued frame to be delivered
    pub fn flush(&self, timeout: Duration) -> RelayResult<()> {
        self.broker.flush(timeout)
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.topic)
            .field("stats", &self.stats)
            .finish()
    }
}
