//! Harvester
//!
//! Owns a session's buffer units and performs one swap + drain pass over them
//! per cycle. Drained regions go through the framer; the resulting frames are
//! returned to the caller, which publishes them outside the session lock.
//!
//! ## Per-unit cycle
//!
//! 1. Skip the unit if its active region was never allocated.
//! 2. Swap, then compare the active region before and after. An unchanged
//!    active region means the swap did not happen: no data this cycle.
//! 3. The drained standby must be the region that was active before the
//!    swap; anything else is logged and treated as no data.
//! 4. Add the region's drop and error counters to the running totals.
//! 5. Frame the region if it holds any bytes.
//!
//! Units are drained in their enumeration order. Every cycle ends by touching
//! the liveness timestamp, even when nothing was drained.

use std::sync::Arc;

use tracing::debug;

use super::buffer::{BufferPolicy, BufferUnit};
use super::error::{RelayError, RelayResult};
use super::framer::frame_records;
use super::liveness::Liveness;
use super::metadata::ClauseSizes;
use super::source::Frame;
use crate::relay_log;

/// Running totals of one session's harvest
///
/// Every counter only ever increases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HarvestStats {
    pub cycles: u64,
    pub drops: u64,
    pub errors: u64,
    pub bytes: u64,
    pub frames: u64,
    pub framing_aborts: u64,
    pub bytes_discarded: u64,
    pub failed_swaps: u64,
    pub inconsistent_swaps: u64,
}

/// Swap-and-drain engine for one session
pub struct Harvester {
    units: Vec<Box<dyn BufferUnit>>,
    sizer: ClauseSizes,
    mtu: usize,
    stats: HarvestStats,
    liveness: Arc<Liveness>,
    fault: Option<RelayError>,
}

impl Harvester {
    /// Create a harvester over `units`
    ///
    /// # Errors
    ///
    /// Rejects any unit whose buffer policy is not switch; ring and fill
    /// buffers are never fully drained before the next swap.
    pub fn new(
        units: Vec<Box<dyn BufferUnit>>,
        sizer: ClauseSizes,
        mtu: usize,
        liveness: Arc<Liveness>,
    ) -> RelayResult<Self> {
        if let Some(unit) = units.iter().find(|u| u.policy() != BufferPolicy::Switch) {
            return Err(RelayError::UnsupportedBufferPolicy {
                unit: unit.unit(),
                policy: unit.policy().as_str(),
            });
        }

        Ok(Self {
            units,
            sizer,
            mtu,
            stats: HarvestStats::default(),
            liveness,
            fault: None,
        })
    }

    pub fn stats(&self) -> HarvestStats {
        self.stats
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Session-fatal error seen while framing, if any
    pub fn fault(&self) -> Option<&RelayError> {
        self.fault.as_ref()
    }

    pub fn liveness(&self) -> &Arc<Liveness> {
        &self.liveness
    }

    /// Run one swap + drain pass over every unit
    pub fn harvest(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();

        for unit in self.units.iter_mut() {
            let Some(before) = unit.active() else {
                continue;
            };

            unit.switch();
            if unit.active() == Some(before) {
                self.stats.failed_swaps += 1;
                debug!(unit = unit.unit(), "Swap did not exchange regions");
                continue;
            }

            let drained = unit.drain_standby();
            if drained.region != before {
                self.stats.inconsistent_swaps += 1;
                let err = RelayError::InconsistentSwap { unit: drained.unit };
                relay_log!(err.severity(), unit = drained.unit, "{}", err);
                continue;
            }

            self.stats.drops += drained.drops;
            self.stats.errors += drained.errors;
            if drained.drops > 0 || drained.errors > 0 {
                debug!(
                    unit = drained.unit,
                    drops = drained.drops,
                    errors = drained.errors,
                    "Region reported drops or errors"
                );
            }

            if drained.data.is_empty() {
                continue;
            }
            self.stats.bytes += drained.data.len() as u64;

            let framed = frame_records(&drained.data, self.mtu, &self.sizer);
            let dropped = framed.dropped(drained.data.len());
            self.stats.frames += framed.frames.len() as u64;
            frames.extend(framed.frames.into_iter().map(Frame::trace));

            if let Some(err) = framed.error {
                self.stats.framing_aborts += 1;
                self.stats.bytes_discarded += dropped as u64;

                let fatal = err.is_fatal();
                let err = RelayError::from(err);
                relay_log!(
                    err.severity(),
                    unit = drained.unit,
                    dropped,
                    "Framing aborted: {}",
                    err
                );
                if fatal && self.fault.is_none() {
                    self.fault = Some(err);
                }
            }
        }

        self.stats.cycles += 1;
        self.liveness.touch();
        frames
    }
}

impl std::fmt::Debug for Harvester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harvester")
            .field("units", &self.units.len())
            .field("mtu", &self.mtu)
            .field("stats", &self.stats)
            .finish()
    }
}
