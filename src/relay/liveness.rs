//! Session liveness heartbeat
//!
//! The instrumentation subsystem condemns a session whose liveness timestamp
//! stops advancing. The harvester touches it once per cycle.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds elapsed on the monotonic clock since the process epoch
pub fn monotonic_nanos() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

/// Liveness timestamp shared with an external health check
#[derive(Debug, Default)]
pub struct Liveness {
    alive: AtomicU64,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last published heartbeat (monotonic nanoseconds, 0 if never touched)
    pub fn last(&self) -> u64 {
        self.alive.load(Ordering::Acquire)
    }

    /// Publish a heartbeat strictly greater than the previous one
    ///
    /// Only the session's worker writes this value.
    pub fn touch(&self) -> u64 {
        let prev = self.alive.load(Ordering::Relaxed);
        let next = monotonic_nanos().max(prev + 1);
        fence(Ordering::Release);
        self.alive.store(next, Ordering::Release);
        next
    }
}
