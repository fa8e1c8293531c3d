//! trace-relay
//!
//! Harvests execution-trace records from per-unit double-buffered memory
//! regions and forwards them, as MTU-bounded frames, to a Kafka topic.
//!
//! The crate has two faces sharing one Framer/Publisher pipeline:
//!
//! - the session face ([`relay::registry::SessionRegistry`]), which owns one
//!   worker per trace session and swaps the session's buffers itself;
//! - the user-space face ([`daemon`]), which receives already-serialized text
//!   fragments from an interpreter process.

// Module declarations
pub mod config; // Runtime configuration
pub mod daemon; // User-space face (PID file, fragment pipeline)
pub mod relay; // Harvesting, framing, publishing, sessions
pub mod worker; // Per-session worker loop

// Test utilities (only compiled in test builds)
#[cfg(test)]
pub mod testing;

// ===== Diagnostic Severity =====

/// Severity of a logged diagnostic
///
/// Low is chatter useful while debugging, Normal marks lifecycle events and
/// High marks conditions that prevent forward progress for a session or the
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

// ===== Logging Macro =====

/// Log a diagnostic at the given [`Priority`]
///
/// Low maps to `tracing::debug!`, Normal to `tracing::info!` and High to
/// `tracing::error!`. Structured fields are accepted the same way `tracing`
/// accepts them:
///
/// ```rust,ignore
/// relay_log!(Priority::High, session = %handle, "record exceeds MTU");
/// ```
#[macro_export]
macro_rules! relay_log {
    ($prio:expr, $($arg:tt)+) => {
        match $prio {
            $crate::Priority::Low => ::tracing::debug!($($arg)+),
            $crate::Priority::Normal => ::tracing::info!($($arg)+),
            $crate::Priority::High => ::tracing::error!($($arg)+),
        }
    };
}

pub use relay::error::{RelayError, RelayResult};
