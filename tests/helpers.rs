// Test helpers for trace-relay integration tests
//
// The crate's own mocks are only compiled for unit tests, so integration
// tests carry a small recording broker and record/catalog builders of their
// own.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use trace_relay::config::Config;
use trace_relay::relay::broker::{BrokerClient, PublishStatus, Topic};
use trace_relay::relay::buffer::{BufferUnit, MemoryBufferPair};
use trace_relay::relay::metadata::{
    ActionDescriptor, ClauseDescriptor, MetadataCatalog, ProbeDescription, RecordDescriptor,
};
use trace_relay::relay::session::SessionResources;
use trace_relay::RelayResult;

#[derive(Default)]
struct BrokerState {
    messages: Vec<(Option<String>, Bytes)>,
    queue_full_remaining: u32,
    pending_reports: usize,
    flushes: u32,
}

/// Broker client that records accepted messages in order
#[derive(Default)]
pub struct RecordingBroker {
    state: Mutex<BrokerState>,
}

impl RecordingBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer the next `n` publishes with queue-full
    pub fn queue_full_for(&self, n: u32) {
        self.state.lock().queue_full_remaining = n;
    }

    /// Payloads accepted under `key`, in publish order
    pub fn payloads(&self, key: &str) -> Vec<Bytes> {
        self.state
            .lock()
            .messages
            .iter()
            .filter(|(k, _)| k.as_deref() == Some(key))
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<Option<String>> {
        self.state.lock().messages.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn flushes(&self) -> u32 {
        self.state.lock().flushes
    }
}

impl BrokerClient for RecordingBroker {
    fn publish(&self, _topic: &Topic, key: Option<&[u8]>, payload: &[u8]) -> PublishStatus {
        let mut state = self.state.lock();
        if state.queue_full_remaining > 0 {
            state.queue_full_remaining -= 1;
            return PublishStatus::QueueFull;
        }
        let key = key.map(|k| String::from_utf8_lossy(k).into_owned());
        state.messages.push((key, Bytes::copy_from_slice(payload)));
        state.pending_reports += 1;
        PublishStatus::Accepted
    }

    fn pump(&self, _timeout: Duration) -> usize {
        std::mem::take(&mut self.state.lock().pending_reports)
    }

    fn flush(&self, _timeout: Duration) -> RelayResult<()> {
        let mut state = self.state.lock();
        state.flushes += 1;
        state.pending_reports = 0;
        Ok(())
    }
}

/// One record of `size` bytes tagged with `clause`, payload filled with `fill`
pub fn record(clause: u32, size: usize, fill: u8) -> Vec<u8> {
    let mut buf = clause.to_ne_bytes().to_vec();
    buf.resize(size, fill);
    buf
}

/// Clause with one 8-byte action per 8 bytes after the clause id
pub fn clause(probe_id: u32, function: &str, size: u32) -> ClauseDescriptor {
    let actions = (0..(size - 4) / 8)
        .map(|i| {
            ActionDescriptor::record(RecordDescriptor {
                action: 1,
                size: 8,
                offset: 4 + i * 8,
                alignment: 8,
                format: 0,
                arg: 0,
            })
        })
        .collect();

    ClauseDescriptor {
        probe: Some(ProbeDescription {
            id: probe_id,
            provider: "syscall".to_string(),
            module: String::new(),
            function: function.to_string(),
            name: "entry".to_string(),
        }),
        user_arg: 0,
        size,
        actions,
    }
}

/// Catalog with one format and clauses 1 (16 bytes) and 2 (40 bytes)
pub fn catalog() -> Arc<MetadataCatalog> {
    let catalog = MetadataCatalog::new();
    catalog.add_format("%d\n");
    catalog.add_clause(Some(clause(1, "open", 16)));
    catalog.add_clause(Some(clause(2, "close", 40)));
    Arc::new(catalog)
}

/// Fast-cycling configuration for tests
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.poll_period_ms = 5;
    config.stop_timeout_ms = 5_000;
    config.final_flush_timeout_ms = 200;
    config.queue_full_pump_ms = 1;
    config.broker.client_id = "trace-relay-it".to_string();
    config
}

/// Session resources over `units` publishing to `broker`
pub fn resources(broker: &Arc<RecordingBroker>, units: Vec<MemoryBufferPair>) -> SessionResources {
    SessionResources {
        owner: 1000,
        units: units
            .into_iter()
            .map(|u| Box::new(u) as Box<dyn BufferUnit>)
            .collect(),
        catalog: catalog(),
        broker: Arc::clone(broker) as Arc<dyn BrokerClient>,
        topic: Topic::new("trace-out").unwrap_or_else(|e| panic!("{}", e)),
    }
}
