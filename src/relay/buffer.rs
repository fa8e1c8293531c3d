//! Per-unit double buffers
//!
//! Each hardware execution unit owns two equally-sized regions: `active`,
//! written by producers, and `standby`, drained by the harvester. A switch
//! exchanges the roles atomically for that unit.
//!
//! [`BufferUnit`] is the capability the harvester consumes. The swap primitive
//! behind it is implementation-defined (cross-unit call, lock, CAS);
//! [`MemoryBufferPair`] implements it in-process with a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::liveness::monotonic_nanos;

/// Buffer policy configured for a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferPolicy {
    /// Regions are exchanged and the standby is fully drained before the next swap
    #[default]
    Switch,
    /// Producers wrap around inside one region
    Ring,
    /// Producers stop when the region fills
    Fill,
}

impl BufferPolicy {
    /// Parse from an option string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "switch" => Some(BufferPolicy::Switch),
            "ring" => Some(BufferPolicy::Ring),
            "fill" => Some(BufferPolicy::Fill),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BufferPolicy::Switch => "switch",
            BufferPolicy::Ring => "ring",
            BufferPolicy::Fill => "fill",
        }
    }
}

/// Identity of one memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(u64);

impl RegionId {
    /// Allocate a process-unique region identity
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        RegionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Contents and metadata of a region taken out of service by a swap
#[derive(Debug, Clone)]
pub struct DrainedRegion {
    /// Unit the region belongs to
    pub unit: usize,
    /// Identity of the drained region
    pub region: RegionId,
    /// Bytes written while the region was active
    pub data: Bytes,
    /// Records dropped while the region was active
    pub drops: u64,
    /// Errors raised while the region was active
    pub errors: u64,
    /// When the region was switched out (monotonic nanoseconds)
    pub switched_at: u64,
}

/// One execution unit's active/standby region pair
pub trait BufferUnit: Send {
    /// Index of the unit (e.g. CPU number)
    fn unit(&self) -> usize;

    /// Configured buffer policy
    fn policy(&self) -> BufferPolicy;

    /// Identity of the region producers currently write into
    ///
    /// `None` when the unit has never been allocated.
    fn active(&self) -> Option<RegionId>;

    /// Exchange the active and standby roles
    ///
    /// The exchange may silently fail; callers compare [`BufferUnit::active`]
    /// before and after.
    fn switch(&mut self);

    /// Take the standby region's contents and counters
    fn drain_standby(&mut self) -> DrainedRegion;
}

#[derive(Debug)]
struct Region {
    id: RegionId,
    data: Vec<u8>,
    drops: u64,
    errors: u64,
}

impl Region {
    fn new(capacity: usize) -> Self {
        Self {
            id: RegionId::next(),
            data: Vec::with_capacity(capacity),
            drops: 0,
            errors: 0,
        }
    }
}

#[derive(Debug)]
struct PairState {
    regions: [Region; 2],
    active: usize,
    capacity: usize,
    allocated: bool,
    fail_next_switch: bool,
    switched_at: u64,
}

/// In-process buffer pair
///
/// The harvester side implements [`BufferUnit`]; producers write through a
/// [`MemoryBufferWriter`] obtained from [`MemoryBufferPair::writer`].
#[derive(Debug)]
pub struct MemoryBufferPair {
    unit: usize,
    policy: BufferPolicy,
    state: Arc<Mutex<PairState>>,
}

impl MemoryBufferPair {
    /// Create an allocated switch-policy pair with regions of `capacity` bytes
    pub fn new(unit: usize, capacity: usize) -> Self {
        Self::with_policy(unit, capacity, BufferPolicy::Switch)
    }

    pub fn with_policy(unit: usize, capacity: usize, policy: BufferPolicy) -> Self {
        Self {
            unit,
            policy,
            state: Arc::new(Mutex::new(PairState {
                regions: [Region::new(capacity), Region::new(capacity)],
                active: 0,
                capacity,
                allocated: true,
                fail_next_switch: false,
                switched_at: 0,
            })),
        }
    }

    /// Create a pair whose active region has never been allocated
    pub fn unallocated(unit: usize) -> Self {
        let pair = Self::new(unit, 0);
        pair.state.lock().allocated = false;
        pair
    }

    /// Producer handle for this pair
    pub fn writer(&self) -> MemoryBufferWriter {
        MemoryBufferWriter {
            state: Arc::clone(&self.state),
        }
    }

    /// Make the next switch leave the roles unchanged, as a failed
    /// cross-unit call would
    pub fn fail_next_switch(&self) {
        self.state.lock().fail_next_switch = true;
    }
}

impl BufferUnit for MemoryBufferPair {
    fn unit(&self) -> usize {
        self.unit
    }

    fn policy(&self) -> BufferPolicy {
        self.policy
    }

    fn active(&self) -> Option<RegionId> {
        let state = self.state.lock();
        state.allocated.then(|| state.regions[state.active].id)
    }

    fn switch(&mut self) {
        let mut state = self.state.lock();
        if !state.allocated {
            return;
        }
        if state.fail_next_switch {
            state.fail_next_switch = false;
            return;
        }

        let next = state.active ^ 1;
        let capacity = state.capacity;
        // The incoming active region was drained on the previous cycle
        let incoming = &mut state.regions[next];
        incoming.data.clear();
        incoming.data.reserve(capacity);
        incoming.drops = 0;
        incoming.errors = 0;
        state.active = next;
        state.switched_at = monotonic_nanos();
    }

    fn drain_standby(&mut self) -> DrainedRegion {
        let mut state = self.state.lock();
        let standby = state.active ^ 1;
        let switched_at = state.switched_at;
        let region = &mut state.regions[standby];

        let drained = DrainedRegion {
            unit: self.unit,
            region: region.id,
            data: Bytes::from(std::mem::take(&mut region.data)),
            drops: region.drops,
            errors: region.errors,
            switched_at,
        };
        region.drops = 0;
        region.errors = 0;
        drained
    }
}

/// Producer handle writing whole records into the active region
#[derive(Debug, Clone)]
pub struct MemoryBufferWriter {
    state: Arc<Mutex<PairState>>,
}

impl MemoryBufferWriter {
    /// Append one record; returns false (and counts a drop) when it does not fit
    pub fn write(&self, record: &[u8]) -> bool {
        let mut state = self.state.lock();
        let capacity = state.capacity;
        let active = state.active;
        let region = &mut state.regions[active];

        if region.data.len() + record.len() > capacity {
            region.drops += 1;
            return false;
        }
        region.data.extend_from_slice(record);
        true
    }

    /// Count an error against the active region
    pub fn record_error(&self) {
        let mut state = self.state.lock();
        let active = state.active;
        state.regions[active].errors += 1;
    }

    /// Bytes written into the active region so far
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.regions[state.active].data.len()
    }
}
