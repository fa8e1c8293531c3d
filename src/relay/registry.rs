//! Session registry
//!
//! Concurrency-safe map from session handle to its running session. Handles
//! are spread over a small fixed number of buckets by a murmur2 hash of the
//! handle's identity; each bucket has its own lock, held only to insert,
//! remove or look up an entry. Opens and closes on handles in different
//! buckets never contend.
//!
//! ## Lifecycle
//!
//! ```text
//! open(handle) ─> validate ─> Session + worker ─> bucket
//! close(handle) ─> unlink from bucket ─> exit flag + wake ─> bounded join
//! ```
//!
//! A worker that does not stop within the configured timeout is an invariant
//! breach: `close()` panics rather than leak the thread.

use std::sync::Arc;

use murmur2::{murmur2, KAFKA_SEED};
use parking_lot::Mutex;

use super::context::RuntimeContext;
use super::error::{RelayError, RelayResult};
use super::harvester::Harvester;
use super::liveness::Liveness;
use super::publisher::Publisher;
use super::session::{Session, SessionHandle, SessionReport, SessionResources};
use crate::worker::{self, WorkerHandle};
use crate::{relay_log, Priority};

struct Entry {
    session: Arc<Session>,
    worker: WorkerHandle,
}

/// Registry of open sessions
pub struct SessionRegistry {
    buckets: Vec<Mutex<Vec<Entry>>>,
    mask: usize,
    ctx: Arc<RuntimeContext>,
}

impl SessionRegistry {
    /// Create an empty registry sized from the context's configuration
    pub fn new(ctx: Arc<RuntimeContext>) -> RelayResult<Self> {
        let config = ctx.config();
        config.validate()?;

        let buckets = (0..config.registry_buckets)
            .map(|_| Mutex::new(Vec::new()))
            .collect();

        Ok(Self {
            buckets,
            mask: config.registry_buckets - 1,
            ctx,
        })
    }

    fn bucket(&self, handle: SessionHandle) -> &Mutex<Vec<Entry>> {
        let hash = murmur2(&handle.id().to_ne_bytes(), KAFKA_SEED) as usize;
        &self.buckets[hash & self.mask]
    }

    /// Create and start a session
    ///
    /// # Errors
    ///
    /// - `AlreadyOpen` if `handle` is registered; the existing session is
    ///   left untouched
    /// - `UnsupportedBufferPolicy` if any unit is not a switch buffer
    /// - `RecordExceedsMtu` if an enabled clause's records cannot fit a frame
    pub fn open(
        &self,
        handle: SessionHandle,
        resources: SessionResources,
    ) -> RelayResult<Arc<Session>> {
        let result = self.try_open(handle, resources);
        if let Err(e) = &result {
            relay_log!(e.severity(), session = %handle, error = %e, "Session open rejected");
        }
        result
    }

    fn try_open(
        &self,
        handle: SessionHandle,
        resources: SessionResources,
    ) -> RelayResult<Arc<Session>> {
        let config = self.ctx.config();
        let SessionResources {
            owner,
            units,
            catalog,
            broker,
            topic,
        } = resources;

        // A registered handle wins over every other precondition
        let mut bucket = self.bucket(handle).lock();
        if bucket.iter().any(|e| e.session.handle() == handle) {
            return Err(RelayError::AlreadyOpen(handle));
        }

        let snapshot = catalog.snapshot();
        snapshot.check_mtu(config.mtu)?;
        let harvester = Harvester::new(
            units,
            snapshot.sizer(),
            config.mtu,
            Arc::new(Liveness::new()),
        )?;

        let session = Arc::new(Session::new(handle, owner, harvester));
        let publisher = Publisher::new(broker, topic, config.queue_full_pump());
        let worker = worker::spawn(
            Arc::clone(&session),
            publisher,
            catalog,
            Arc::clone(&self.ctx),
        )?;

        bucket.push(Entry {
            session: Arc::clone(&session),
            worker,
        });

        relay_log!(Priority::Normal, session = %handle, owner, "Session opened");
        Ok(session)
    }

    /// Stop a session and wait for its final drain
    ///
    /// Blocks for at most the configured stop timeout.
    ///
    /// # Panics
    ///
    /// If the worker does not stop within the timeout.
    pub fn close(&self, handle: SessionHandle) -> RelayResult<SessionReport> {
        let entry = {
            let mut bucket = self.bucket(handle).lock();
            let position = bucket.iter().position(|e| e.session.handle() == handle);
            match position {
                Some(i) => bucket.swap_remove(i),
                None => {
                    relay_log!(Priority::Normal, session = %handle, "Close for unknown session");
                    return Err(RelayError::UnknownSession(handle));
                }
            }
        };

        entry.session.request_stop();

        let timeout = self.ctx.config().stop_timeout();
        let report = match entry.worker.join(timeout) {
            Ok(report) => report,
            Err(e) => {
                relay_log!(Priority::High, session = %handle, error = %e, "Session worker leaked");
                panic!("{}", e);
            }
        };

        relay_log!(
            Priority::Normal,
            session = %handle,
            frames = report.publisher.enqueued,
            "Session closed"
        );
        Ok(report)
    }

    /// Close every registered session
    pub fn stop_all(&self) -> Vec<(SessionHandle, SessionReport)> {
        let handles: Vec<SessionHandle> = self
            .buckets
            .iter()
            .flat_map(|b| {
                b.lock()
                    .iter()
                    .map(|e| e.session.handle())
                    .collect::<Vec<_>>()
            })
            .collect();

        handles
            .into_iter()
            .filter_map(|handle| {
                // A concurrent close may have won the race
                self.close(handle).ok().map(|report| (handle, report))
            })
            .collect()
    }

    /// Look up a running session
    pub fn get(&self, handle: SessionHandle) -> Option<Arc<Session>> {
        self.bucket(handle)
            .lock()
            .iter()
            .find(|e| e.session.handle() == handle)
            .map(|e| Arc::clone(&e.session))
    }

    pub fn contains(&self, handle: SessionHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        let closed = self.stop_all();
        if !closed.is_empty() {
            relay_log!(
                Priority::Normal,
                sessions = closed.len(),
                "Closed remaining sessions"
            );
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("buckets", &self.buckets.len())
            .field("sessions", &self.len())
            .finish()
    }
}
