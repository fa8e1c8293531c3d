//! Relay error types
//!
//! One error enum for the whole pipeline. Per-cycle errors (framing aborts,
//! dropped frames) are logged and never tear a session down; setup-time
//! preconditions reject a session open; a stop timeout is an invariant breach.

use thiserror::Error;

use crate::relay::framer::FramingError;
use crate::relay::session::SessionHandle;
use crate::Priority;

/// Errors that can occur while harvesting, framing or publishing
#[derive(Error, Debug)]
pub enum RelayError {
    /// A session with this handle is already registered
    #[error("Session {0} is already open")]
    AlreadyOpen(SessionHandle),

    /// No session with this handle is registered
    #[error("Session {0} is not registered")]
    UnknownSession(SessionHandle),

    /// A buffer unit uses a policy other than "switch"
    #[error("Buffer unit {unit} uses the {policy} policy; only switch is supported")]
    UnsupportedBufferPolicy { unit: usize, policy: &'static str },

    /// An enabled clause's record cannot fit in one frame
    #[error("Record size {size} for clause {clause} exceeds MTU {mtu}")]
    RecordExceedsMtu { clause: u32, size: usize, mtu: usize },

    /// Framing stopped at an unknown clause id
    #[error("Unknown record size for clause {clause} at offset {offset}")]
    UnknownRecordSize { clause: u32, offset: usize },

    /// Framing stopped at a record running past the end of the region
    #[error("Truncated record at offset {offset}: needs {needed} bytes, {available} available")]
    TruncatedRecord {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// The region drained after a swap is not the one that was active before it
    #[error("Buffer unit {unit} swapped inconsistently")]
    InconsistentSwap { unit: usize },

    /// Publishing the descriptor tables failed
    #[error("Metadata export failed: {0}")]
    MetadataExport(String),

    /// Broker client error (configuration, creation, fatal publish, flush)
    #[error("Broker error: {0}")]
    Broker(String),

    /// A worker did not stop within the bounded wait
    #[error("Session {handle} worker did not stop within {timeout_ms}ms")]
    StopTimeout {
        handle: SessionHandle,
        timeout_ms: u64,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// PID file could not be created, locked or written
    #[error("PID file error: {0}")]
    PidFile(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Descriptor serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Severity at which this error is reported
    ///
    /// High-severity errors prevent forward progress for a session (or the
    /// process); the rest are local to one harvest cycle.
    pub fn severity(&self) -> Priority {
        match self {
            RelayError::UnknownRecordSize { .. }
            | RelayError::TruncatedRecord { .. }
            | RelayError::InconsistentSwap { .. } => Priority::Normal,
            RelayError::AlreadyOpen(_) | RelayError::UnknownSession(_) => Priority::Normal,
            RelayError::UnsupportedBufferPolicy { .. }
            | RelayError::RecordExceedsMtu { .. }
            | RelayError::MetadataExport(_)
            | RelayError::Broker(_)
            | RelayError::StopTimeout { .. }
            | RelayError::InvalidConfig(_)
            | RelayError::PidFile(_)
            | RelayError::Io(_)
            | RelayError::Serialization(_) => Priority::High,
        }
    }

    /// Whether this error rejects a session open
    pub fn rejects_open(&self) -> bool {
        matches!(
            self,
            RelayError::AlreadyOpen(_)
                | RelayError::UnsupportedBufferPolicy { .. }
                | RelayError::RecordExceedsMtu { .. }
                | RelayError::InvalidConfig(_)
        )
    }
}

impl From<FramingError> for RelayError {
    fn from(err: FramingError) -> Self {
        match err {
            FramingError::UnknownRecordSize { clause, offset } => {
                RelayError::UnknownRecordSize { clause, offset }
            }
            FramingError::Truncated {
                offset,
                needed,
                available,
            } => RelayError::TruncatedRecord {
                offset,
                needed,
                available,
            },
            FramingError::RecordExceedsMtu { clause, size, mtu } => {
                RelayError::RecordExceedsMtu { clause, size, mtu }
            }
        }
    }
}

impl From<rdkafka::error::KafkaError> for RelayError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        RelayError::Broker(err.to_string())
    }
}

/// Result type alias for relay operations
pub type RelayResult<T> = std::result::Result<T, RelayError>;
