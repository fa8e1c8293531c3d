//! Testing utilities for trace-relay
//!
//! Test doubles for the external collaborators the pipeline consumes: the
//! broker client and the instrumentation subsystem's descriptor tables. Only
//! compiled when running tests.
//!
//! # Organization
//! - `mocks.rs` - `MockBroker` with scripted queue-full / fatal responses
//! - `helpers.rs` - record, region and catalog fixtures
//!
//! # Logging Macros
//! The `relay_log!` macro is defined in src/lib.rs and is available throughout
//! the codebase.

#![cfg(test)]

pub mod helpers;
pub mod mocks;

// Re-export commonly used items
pub use helpers::{mock_config, record, region_of, sample_catalog};
pub use mocks::{MockBroker, PublishedMessage};
