//! Relay constants
//!
//! Centralizes the magic numbers used by the harvesting pipeline, the broker
//! client and the user-space daemon. Every tunable has a DEFAULT and, where the
//! value is validated, a MIN/MAX pair.

// ===== Record Layout =====

/// Size of the clause identifier at the head of every record (a `u32`)
pub const CLAUSE_ID_SIZE: usize = 4;

/// Clause id marking filler bytes; skipped by its header size only
pub const CLAUSE_ID_NONE: u32 = 0;

// ===== Message Keys =====

/// Key attached to every trace frame
///
/// The user-space consumer rejects inbound messages carrying any other key.
pub const TRACE_KEY: &str = "trace";

/// Key for format-string descriptor messages
pub const FORMAT_KEY: &str = "format";

/// Key for probe descriptor messages
pub const PROBE_KEY: &str = "probe";

/// Key for enabled-probe (clause) descriptor messages
pub const EPROBE_KEY: &str = "eprobe";

// ===== Harvest Cycle =====

/// Default harvest period in milliseconds
pub const DEFAULT_POLL_PERIOD_MS: u64 = 1000;
pub const MIN_POLL_PERIOD_MS: u64 = 1;
pub const MAX_POLL_PERIOD_MS: u64 = 60_000;

/// Default maximum frame size (bytes) before compression
///
/// Heuristic bound chosen from the compression ratio observed on trace
/// buffers; the broker's `message.max.bytes` is derived from it.
pub const DEFAULT_MTU: usize = 1024 * 1024;

/// Smallest MTU accepted; must hold at least one clause id
pub const MIN_MTU: usize = 64;

// ===== Session Lifecycle =====

/// Default bound on `close()` waiting for the worker to stop (milliseconds)
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 60_000;
pub const MIN_STOP_TIMEOUT_MS: u64 = 100;

/// Default bound on publisher retries during the final flush cycle
pub const DEFAULT_FINAL_FLUSH_TIMEOUT_MS: u64 = 10_000;

/// Default number of registry buckets (power of two)
pub const DEFAULT_REGISTRY_BUCKETS: usize = 16;

// ===== Broker =====

/// Default bootstrap servers for the broker client
pub const DEFAULT_BOOTSTRAP_SERVERS: &str = "";

/// Default bounded pump while the producer queue is full (milliseconds)
pub const DEFAULT_QUEUE_FULL_PUMP_MS: u64 = 1000;

/// Default bounded flush before destroying the producer (milliseconds)
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 10_000;

/// Default compression codec for produced messages
pub const DEFAULT_COMPRESSION: &str = "gzip";

/// Default producer linger in milliseconds
pub const DEFAULT_LINGER_MS: u32 = 10;

/// Default consumer auto-commit interval in milliseconds
pub const DEFAULT_AUTO_COMMIT_INTERVAL_MS: u32 = 1000;

/// Partition consumed by the user-space face
pub const INPUT_PARTITION: i32 = 0;

// ===== User-space Daemon =====

/// Default PID file for singleton-instance locking
pub const DEFAULT_PIDFILE: &str = "/var/run/trace-relay.pid";

/// Default consumer poll interval in microseconds (100ms)
pub const DEFAULT_CONSUMER_POLL_US: u64 = 100_000;

/// Default interpreter invoked with `-s <script>`
pub const DEFAULT_INTERPRETER: &str = "dtrace";

/// Bounded wait for the interpreter to exit after SIGTERM
pub const DECOMMISSION_WAIT_MS: u64 = 5_000;

/// Default hypervisor subscriber socket carrying guest trace buffers
pub const DEFAULT_GUEST_SOCKET: &str = "/var/ddtrace/sub.sock";

/// Inbound trace frames buffered between the consumer and the interpreter
pub const INBOUND_CHANNEL_CAPACITY: usize = 64;

/// Test client id
#[cfg(test)]
pub const TEST_CLIENT_ID: &str = "trace-relay-test";
