//! Trace sessions
//!
//! A [`Session`] bundles one harvester with its lifecycle state behind a
//! single per-session lock. The exit flag, the lifecycle state and the buffer
//! units are always read and written under that same lock; the worker waits
//! on the session's condition variable so a close wakes it immediately.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::broker::{BrokerClient, Topic};
use super::buffer::BufferUnit;
use super::harvester::{HarvestStats, Harvester};
use super::liveness::Liveness;
use super::metadata::{ExportSummary, MetadataCatalog};
use super::publisher::{PublisherStats, StopSignal};

/// Opaque identity of a trace session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn new(id: u64) -> Self {
        SessionHandle(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Session lifecycle
///
/// `Running -> Draining -> (Running | Stopping) -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Waiting for the next cycle
    Running,
    /// A swap + drain + publish cycle is in progress
    Draining,
    /// The final cycle has completed; the worker is exiting
    Stopping,
    /// The worker has exited
    Stopped,
}

/// What a session needs from the instrumentation subsystem and the broker
pub struct SessionResources {
    /// Owning process or thread
    pub owner: u32,
    /// One buffer pair per execution unit
    pub units: Vec<Box<dyn BufferUnit>>,
    /// Descriptor tables behind the global metadata lock
    pub catalog: Arc<MetadataCatalog>,
    /// Broker client frames are published through
    pub broker: Arc<dyn BrokerClient>,
    /// Destination topic
    pub topic: Topic,
}

impl std::fmt::Debug for SessionResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionResources")
            .field("owner", &self.owner)
            .field("units", &self.units.len())
            .field("topic", &self.topic)
            .finish()
    }
}

/// Mutable state guarded by the per-session lock
#[derive(Debug)]
pub struct SessionState {
    pub(crate) exit: bool,
    pub(crate) lifecycle: LifecycleState,
    pub(crate) harvester: Harvester,
}

impl SessionState {
    pub fn exit_requested(&self) -> bool {
        self.exit
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn harvester(&self) -> &Harvester {
        &self.harvester
    }
}

/// One active trace session
#[derive(Debug)]
pub struct Session {
    handle: SessionHandle,
    owner: u32,
    liveness: Arc<Liveness>,
    state: Mutex<SessionState>,
    wake: Condvar,
}

impl Session {
    pub(crate) fn new(handle: SessionHandle, owner: u32, harvester: Harvester) -> Self {
        Self {
            handle,
            owner,
            liveness: Arc::clone(harvester.liveness()),
            state: Mutex::new(SessionState {
                exit: false,
                lifecycle: LifecycleState::Running,
                harvester,
            }),
            wake: Condvar::new(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    /// Liveness timestamp touched once per harvest cycle
    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Take the per-session lock
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.state.lock().lifecycle
    }

    pub fn harvest_stats(&self) -> HarvestStats {
        self.state.lock().harvester.stats()
    }

    /// Set the exit flag and wake the worker
    pub fn request_stop(&self) {
        let mut state = self.state.lock();
        state.exit = true;
        self.wake.notify_all();
    }

    /// Sleep until `period` elapses or a stop is requested
    ///
    /// Returns immediately when the exit flag is already set.
    pub(crate) fn wait(&self, state: &mut MutexGuard<'_, SessionState>, period: Duration) {
        if !state.exit {
            self.wake.wait_for(state, period);
        }
    }
}

impl StopSignal for Session {
    fn should_stop(&self) -> bool {
        self.state.lock().exit
    }
}

/// Final statistics of a closed session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub harvest: HarvestStats,
    pub publisher: PublisherStats,
    /// Descriptor messages published, `None` if the export failed
    pub metadata: Option<ExportSummary>,
    /// Cycles run after the exit flag was observed
    pub final_cycles: u32,
    /// Why the session stopped on its own, if it did
    pub fault: Option<String>,
}
