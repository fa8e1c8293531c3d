// Session worker module for trace-relay
//
// Every open session owns one dedicated worker thread. The worker exports the
// session's descriptor tables, then runs a timed swap + drain + publish cycle
// until the session's exit flag is observed at a wake point, runs exactly one
// final cycle and reports back to whoever is waiting in close().

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};

use crate::relay::context::RuntimeContext;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::metadata::{MetadataCatalog, MetadataExporter};
use crate::relay::publisher::{Deadline, Publisher};
use crate::relay::session::{LifecycleState, Session, SessionHandle, SessionReport};
use crate::relay::source::Frame;
use crate::{relay_log, Priority};

/// Handle on a running worker
#[derive(Debug)]
pub struct WorkerHandle {
    handle: SessionHandle,
    thread: JoinHandle<()>,
    done: Receiver<SessionReport>,
}

impl WorkerHandle {
    /// Wait up to `timeout` for the worker to finish and join it
    ///
    /// # Errors
    ///
    /// Returns `StopTimeout` when the worker is still running after `timeout`.
    /// A worker that panicked re-raises its panic here.
    pub fn join(self, timeout: Duration) -> RelayResult<SessionReport> {
        match self.done.recv_timeout(timeout) {
            Ok(report) => {
                if let Err(panic) = self.thread.join() {
                    std::panic::resume_unwind(panic);
                }
                Ok(report)
            }
            Err(RecvTimeoutError::Timeout) => Err(RelayError::StopTimeout {
                handle: self.handle,
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => match self.thread.join() {
                Err(panic) => std::panic::resume_unwind(panic),
                // The worker always reports before exiting
                Ok(()) => Ok(SessionReport::default()),
            },
        }
    }

    /// Whether the worker thread has exited
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Start the worker for `session`
pub fn spawn(
    session: Arc<Session>,
    publisher: Publisher,
    catalog: Arc<MetadataCatalog>,
    ctx: Arc<RuntimeContext>,
) -> RelayResult<WorkerHandle> {
    let (done_tx, done) = bounded(1);
    let handle = session.handle();
    let name = format!("relay-{}", handle);

    let thread = std::thread::Builder::new().name(name).spawn(move || {
        let report = run(&session, publisher, &catalog, &ctx);
        // close() may have given up on us already
        let _ = done_tx.send(report);
    })?;

    Ok(WorkerHandle {
        handle,
        thread,
        done,
    })
}

/// Worker main loop
fn run(
    session: &Session,
    mut publisher: Publisher,
    catalog: &MetadataCatalog,
    ctx: &RuntimeContext,
) -> SessionReport {
    let handle = session.handle();
    let mut report = SessionReport::default();

    relay_log!(
        Priority::Normal,
        session = %handle,
        owner = session.owner(),
        topic = %publisher.topic(),
        "Session worker started"
    );

    // Step 1: Descriptor tables go out before the first harvest cycle
    match MetadataExporter::export(catalog, &mut publisher, session) {
        Ok(summary) => report.metadata = Some(summary),
        Err(e) => {
            relay_log!(e.severity(), session = %handle, error = %e, "Metadata export failed");
            report.fault = Some(e.to_string());
            session.request_stop();
        }
    }

    // Step 2: Timed cycles until the exit flag is observed at a wake point.
    // Frames a cycle could not enqueue before the exit flag was set lead the
    // final cycle's batch.
    let mut carried: Vec<Frame> = Vec::new();
    loop {
        let cfg = ctx.config();

        let (harvested, exiting) = {
            let mut state = session.lock();
            session.wait(&mut state, cfg.poll_period());
            let exiting = state.exit;
            state.lifecycle = LifecycleState::Draining;
            (state.harvester.harvest(), exiting)
        };
        let mut frames = std::mem::take(&mut carried);
        frames.extend(harvested);

        // Frames are published outside the session lock. The final cycle runs
        // after the exit flag is set, so it is bounded by a deadline instead.
        let outcome = if exiting {
            report.final_cycles += 1;
            publisher.publish_cycle(&frames, &Deadline::after(cfg.final_flush_timeout()))
        } else {
            publisher.publish_cycle(&frames, session)
        };

        if exiting {
            publisher.abandon(outcome.pending);
        } else {
            carried = outcome.unpublished(&frames).to_vec();
        }

        if outcome.dropped > 0 || outcome.pending > 0 {
            relay_log!(
                Priority::Normal,
                session = %handle,
                dropped = outcome.dropped,
                pending = outcome.pending,
                "Frames not enqueued this cycle"
            );
        }

        let mut state = session.lock();
        if exiting {
            state.lifecycle = LifecycleState::Stopping;
            break;
        }
        state.lifecycle = LifecycleState::Running;

        // A record larger than the MTU repeats every cycle; stop the session
        if report.fault.is_none() {
            if let Some(fault) = state.harvester.fault() {
                relay_log!(fault.severity(), session = %handle, error = %fault, "Stopping faulted session");
                report.fault = Some(fault.to_string());
                state.exit = true;
            }
        }
    }

    // Step 3: Bounded flush of everything still queued
    let cfg = ctx.config();
    if let Err(e) = publisher.flush(cfg.flush_timeout()) {
        relay_log!(Priority::High, session = %handle, error = %e, "Final flush incomplete");
    }

    // Step 4: Report
    let mut state = session.lock();
    state.lifecycle = LifecycleState::Stopped;
    report.harvest = state.harvester.stats();
    report.publisher = publisher.stats();

    relay_log!(
        Priority::Normal,
        session = %handle,
        cycles = report.harvest.cycles,
        frames = report.harvest.frames,
        drops = report.harvest.drops,
        "Session worker stopped"
    );
    report
}
