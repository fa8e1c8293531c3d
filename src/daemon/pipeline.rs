//! Fragment pipeline
//!
//! Three loops run side by side and talk over channels:
//!
//! ```text
//! consumer thread ─Bytes─> relay() ─stdin─> interpreter
//!                          relay() <─stdout─ interpreter
//!                          relay() ─Frame─> publisher thread ─> broker
//! guest socket ─> forward_guest() ─Frame─> publisher thread
//! ```
//!
//! Only `relay()` is async. The consumer and the publisher block on the
//! broker client, so each gets its own thread and the runtime never stalls
//! behind a full producer queue.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::relay::broker::{Inbound, TraceConsumer};
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::publisher::{Publisher, PublisherStats, StopSignal};
use crate::relay::source::{FragmentSource, Frame, FrameSource};
use crate::{relay_log, Priority};

/// Process-wide stop request shared with the blocking threads
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl StopSignal for ShutdownFlag {
    fn should_stop(&self) -> bool {
        self.is_set()
    }
}

/// Source of inbound trace frames for the consumer thread
pub trait TracePoller: Send + 'static {
    fn poll_trace(&self, timeout: Duration) -> RelayResult<Inbound>;
}

impl TracePoller for TraceConsumer {
    fn poll_trace(&self, timeout: Duration) -> RelayResult<Inbound> {
        self.poll(timeout)
    }
}

/// Start the consumer thread
///
/// Runs until `shutdown` is set or the relay drops its end of `inbound`.
/// Returns the number of frames forwarded.
pub fn spawn_consumer<P: TracePoller>(
    poller: P,
    inbound: mpsc::Sender<Bytes>,
    shutdown: ShutdownFlag,
    poll: Duration,
) -> RelayResult<JoinHandle<u64>> {
    let thread = std::thread::Builder::new()
        .name("relay-consumer".to_string())
        .spawn(move || {
            let mut forwarded = 0;
            while !shutdown.is_set() {
                match poller.poll_trace(poll) {
                    Ok(Inbound::Trace(payload)) => {
                        if inbound.blocking_send(payload).is_err() {
                            debug!("Relay loop gone, consumer stopping");
                            break;
                        }
                        forwarded += 1;
                    }
                    Ok(Inbound::Ignored(_)) | Ok(Inbound::Idle) => {}
                    Err(e) => {
                        relay_log!(e.severity(), error = %e, "Consumer poll failed");
                        std::thread::sleep(poll);
                    }
                }
            }
            forwarded
        })?;
    Ok(thread)
}

/// Start the publisher thread
///
/// Each cycle takes whatever frames arrived within `cycle`, publishes them in
/// order and pumps delivery reports. Once every sender is gone the remaining
/// frames are published and the producer is flushed for at most
/// `flush_timeout`.
pub fn spawn_publisher(
    mut publisher: Publisher,
    frames: Receiver<Frame>,
    shutdown: ShutdownFlag,
    cycle: Duration,
    flush_timeout: Duration,
) -> RelayResult<JoinHandle<PublisherStats>> {
    let thread = std::thread::Builder::new()
        .name("relay-publisher".to_string())
        .spawn(move || {
            loop {
                let batch = match frames.recv_timeout(cycle) {
                    Ok(first) => {
                        let mut batch = vec![first];
                        batch.extend(frames.try_iter());
                        batch
                    }
                    Err(RecvTimeoutError::Timeout) => Vec::new(),
                    Err(RecvTimeoutError::Disconnected) => break,
                };

                let outcome = publisher.publish_cycle(&batch, &shutdown);
                publisher.abandon(outcome.pending);
                if outcome.dropped > 0 || outcome.pending > 0 {
                    warn!(
                        dropped = outcome.dropped,
                        abandoned = outcome.pending,
                        "Frames not enqueued this cycle"
                    );
                }
            }

            if let Err(e) = publisher.flush(flush_timeout) {
                relay_log!(Priority::High, error = %e, "Final flush incomplete");
            }
            publisher.stats()
        })?;
    Ok(thread)
}

/// Why the relay loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// SIGINT/SIGTERM (or the shutdown sender went away)
    Shutdown,
    /// The interpreter closed its stdout
    InterpreterExited,
}

/// Relay loop counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub inbound: u64,
    pub fragments: u64,
    pub frames: u64,
    pub discarded: u64,
    /// Lines copied to stdout when nothing is published
    pub echoed: u64,
}

/// Shuttle inbound frames to the interpreter and its output to the publisher
///
/// Every stdout line is one fragment. Without an `outbound` channel nothing
/// is published and the lines are copied to the daemon's own stdout instead.
/// When `inbound` closes, the interpreter's stdin is closed too.
pub async fn relay<R, W>(
    stdout: R,
    stdin: W,
    mut inbound: mpsc::Receiver<Bytes>,
    outbound: Option<&Sender<Frame>>,
    mut shutdown: watch::Receiver<bool>,
) -> RelayResult<(RelayExit, RelayStats)>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = stdout.lines();
    let mut stdin = Some(stdin);
    let mut source = FragmentSource::new();
    let mut stats = RelayStats::default();
    let mut echo = tokio::io::stdout();

    let exit = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break RelayExit::Shutdown;
                }
            }
            line = lines.next_line() => match line? {
                Some(mut line) => {
                    line.push('\n');
                    let Some(outbound) = outbound else {
                        echo.write_all(line.as_bytes()).await?;
                        stats.echoed += 1;
                        continue;
                    };
                    source.on_fragment(&line);
                    for frame in source.drain_frames() {
                        outbound
                            .send(frame)
                            .map_err(|_| RelayError::Broker("publisher thread stopped".to_string()))?;
                        stats.frames += 1;
                    }
                }
                None => break RelayExit::InterpreterExited,
            },
            payload = inbound.recv(), if stdin.is_some() => match payload {
                Some(payload) => {
                    stats.inbound += 1;
                    if let Some(writer) = stdin.as_mut() {
                        if let Err(e) = writer.write_all(&payload).await {
                            warn!(error = %e, "Interpreter stopped reading its input");
                            stdin = None;
                        }
                    }
                }
                None => {
                    debug!("Input closed, closing interpreter stdin");
                    stdin = None;
                }
            },
        }
    };

    stats.fragments = source.fragments();
    stats.discarded = source.discarded();
    if source.in_message() {
        debug!("Unterminated message dropped at exit");
    }
    Ok((exit, stats))
}

/// Interpreter child process with its pipes taken
#[derive(Debug)]
pub struct Interpreter {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: BufReader<ChildStdout>,
}

impl Interpreter {
    /// Run `program -s <script> [args...]` with piped stdin and stdout
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(program: &str, script: &Path, args: &[String]) -> RelayResult<Self> {
        let mut child = Command::new(program)
            .arg("-s")
            .arg(script)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::Io(std::io::Error::new(e.kind(), format!("{}: {}", program, e))))?;

        let missing = |pipe: &str| {
            RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("interpreter {} not captured", pipe),
            ))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        info!(program, script = %script.display(), pid = ?child.id(), "Interpreter started");
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }
}

/// Ask the interpreter to exit, then reap it within `wait`
pub async fn stop_interpreter(child: Child, wait: Duration) -> Option<ExitStatus> {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "Interpreter already gone");
        }
    }
    reap_interpreter(child, wait).await
}

/// Wait at most `wait` for the interpreter to exit, then kill it
///
/// Returns the interpreter's exit status, or `None` when it had to be killed
/// or could not be reaped.
pub async fn reap_interpreter(mut child: Child, wait: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(wait, child.wait()).await {
        Ok(Ok(status)) => {
            info!(%status, "Interpreter exited");
            Some(status)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Failed to reap interpreter");
            None
        }
        Err(_) => {
            warn!(wait_ms = wait.as_millis() as u64, "Interpreter did not exit, killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill interpreter");
            }
            None
        }
    }
}
