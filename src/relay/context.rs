//! Runtime context for shared configuration
//!
//! Workers read the configuration once per cycle through this context, so an
//! operator can change tunables such as the poll period without restarting
//! sessions.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::config::Config;
use crate::relay::error::RelayResult;

/// Shared, swappable configuration
///
/// Uses `Arc<Config>` internally so that taking a snapshot is a single pointer
/// copy. Updates acquire the write lock briefly to swap the pointer; snapshots
/// taken before an update keep the old values.
///
/// # Usage
///
/// ```rust,ignore
/// let ctx = Arc::new(RuntimeContext::new(Config::default()));
///
/// // Each worker cycle
/// let cfg = ctx.config();
/// let period = cfg.poll_period();
///
/// // Operator tuning
/// ctx.update(|c| c.poll_period_ms = 250)?;
/// ```
#[derive(Debug)]
pub struct RuntimeContext {
    config: RwLock<Arc<Config>>,
}

impl RuntimeContext {
    /// Create a new runtime context with the given configuration
    pub fn new(config: Config) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
        }
    }

    /// Get the current config (cheap Arc clone)
    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    /// Apply a change and swap in the result if it validates
    ///
    /// On a validation error the current configuration is left untouched.
    pub fn update<F>(&self, change: F) -> RelayResult<()>
    where
        F: FnOnce(&mut Config),
    {
        let mut guard = self.config.write();
        let mut next = Config::clone(&guard);
        change(&mut next);
        next.validate()?;
        *guard = Arc::new(next);
        Ok(())
    }
}
