// Configuration module for trace-relay
//
// Every tunable has a named default (and, where validated, MIN/MAX bounds) in
// relay::constants. The daemon builds a Config from its command line; session
// workers read it through relay::context::RuntimeContext.

use std::time::Duration;

use crate::relay::broker::BrokerConfig;
use crate::relay::constants::{
    DEFAULT_FINAL_FLUSH_TIMEOUT_MS, DEFAULT_FLUSH_TIMEOUT_MS, DEFAULT_MTU,
    DEFAULT_POLL_PERIOD_MS, DEFAULT_QUEUE_FULL_PUMP_MS, DEFAULT_REGISTRY_BUCKETS,
    DEFAULT_STOP_TIMEOUT_MS, MAX_POLL_PERIOD_MS, MIN_MTU, MIN_POLL_PERIOD_MS,
    MIN_STOP_TIMEOUT_MS,
};
use crate::relay::error::{RelayError, RelayResult};

/// Configuration struct holding all trace-relay settings
///
/// The TLS key password inside `broker` is redacted from `Debug` output.
#[derive(Debug, Clone)]
pub struct Config {
    /// Harvest period in milliseconds (operator-tunable at runtime)
    pub poll_period_ms: u64,
    /// Maximum frame size in bytes
    pub mtu: usize,
    /// Bound on `close()` waiting for a worker to stop (milliseconds)
    pub stop_timeout_ms: u64,
    /// Bound on queue-full retries during the final flush cycle (milliseconds)
    pub final_flush_timeout_ms: u64,
    /// Bounded delivery-report pump while the producer queue is full (milliseconds)
    pub queue_full_pump_ms: u64,
    /// Bounded producer flush on shutdown (milliseconds)
    pub flush_timeout_ms: u64,
    /// Number of session registry buckets (power of two)
    pub registry_buckets: usize,
    /// Broker connection settings
    pub broker: BrokerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_period_ms: DEFAULT_POLL_PERIOD_MS,
            mtu: DEFAULT_MTU,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
            final_flush_timeout_ms: DEFAULT_FINAL_FLUSH_TIMEOUT_MS,
            queue_full_pump_ms: DEFAULT_QUEUE_FULL_PUMP_MS,
            flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
            registry_buckets: DEFAULT_REGISTRY_BUCKETS,
            broker: BrokerConfig::default(),
        }
    }
}

impl Config {
    /// Check every value against its bounds
    pub fn validate(&self) -> RelayResult<()> {
        if !(MIN_POLL_PERIOD_MS..=MAX_POLL_PERIOD_MS).contains(&self.poll_period_ms) {
            return Err(RelayError::InvalidConfig(format!(
                "poll_period_ms must be within {}..={}, got {}",
                MIN_POLL_PERIOD_MS, MAX_POLL_PERIOD_MS, self.poll_period_ms
            )));
        }

        if self.mtu < MIN_MTU {
            return Err(RelayError::InvalidConfig(format!(
                "mtu must be at least {} bytes, got {}",
                MIN_MTU, self.mtu
            )));
        }

        if self.stop_timeout_ms < MIN_STOP_TIMEOUT_MS {
            return Err(RelayError::InvalidConfig(format!(
                "stop_timeout_ms must be at least {}, got {}",
                MIN_STOP_TIMEOUT_MS, self.stop_timeout_ms
            )));
        }

        if self.queue_full_pump_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "queue_full_pump_ms must be positive".to_string(),
            ));
        }

        if !self.registry_buckets.is_power_of_two() {
            return Err(RelayError::InvalidConfig(format!(
                "registry_buckets must be a power of two, got {}",
                self.registry_buckets
            )));
        }

        Ok(())
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn final_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.final_flush_timeout_ms)
    }

    pub fn queue_full_pump(&self) -> Duration {
        Duration::from_millis(self.queue_full_pump_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Broker settings with the producer sized for this MTU
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            mtu: self.mtu,
            ..self.broker.clone()
        }
    }
}
