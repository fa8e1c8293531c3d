// User-space daemon for trace-relay
//
// The daemon is the second face of the relay. It does not own any buffers:
// keyed trace frames arrive on an input topic, are fed to an interpreter
// process, and the interpreter's already-serialized text output is framed on
// `{`/`}` markers and published to the output topic through the same
// Publisher the session workers use.
//
// Startup order matters. Everything that can fail (config, PID file lock,
// broker clients, runtime, the interpreter process, the guest socket) is set
// up before any thread is started, so a setup failure leaves nothing behind
// to tear down.

pub mod guest;
pub mod pidfile;
pub mod pipeline;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::Sender;
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::Config;
use crate::relay::broker::{KafkaBrokerBuilder, Topic, TraceConsumer};
use crate::relay::constants::{
    DECOMMISSION_WAIT_MS, DEFAULT_CONSUMER_POLL_US, DEFAULT_INTERPRETER, DEFAULT_PIDFILE,
    INBOUND_CHANNEL_CAPACITY,
};
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::publisher::{Publisher, PublisherStats};
use crate::relay::source::Frame;

pub use guest::GuestSource;
pub use pidfile::PidFile;
pub use pipeline::{Interpreter, RelayExit, RelayStats, ShutdownFlag};

/// Everything the daemon needs to run
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub config: Config,
    pub input_topic: Topic,
    /// Without an output topic the interpreter's output goes to stdout
    pub output_topic: Option<Topic>,
    pub interpreter: String,
    pub script: PathBuf,
    pub script_args: Vec<String>,
    pub consumer_poll: Duration,
    pub pidfile: PathBuf,
    /// Subscriber socket carrying guest trace buffers
    pub guest_socket: Option<PathBuf>,
}

impl DaemonOptions {
    /// Options with the default interpreter, poll interval and PID file
    pub fn new(config: Config, input_topic: Topic, script: PathBuf) -> Self {
        Self {
            config,
            input_topic,
            output_topic: None,
            interpreter: DEFAULT_INTERPRETER.to_string(),
            script,
            script_args: Vec::new(),
            consumer_poll: Duration::from_micros(DEFAULT_CONSUMER_POLL_US),
            pidfile: PathBuf::from(DEFAULT_PIDFILE),
            guest_socket: None,
        }
    }
}

/// What the daemon did before it exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonSummary {
    pub exit: RelayExit,
    pub relay: RelayStats,
    pub consumed: u64,
    pub guest_buffers: u64,
    /// Exit code of the interpreter, `None` if it was signalled or killed
    pub interpreter_status: Option<i32>,
    pub publisher: PublisherStats,
}

impl DaemonSummary {
    /// Process exit code
    ///
    /// An interpreter that exited on its own decides the code; a shutdown on
    /// SIGINT/SIGTERM is clean.
    pub fn exit_code(&self) -> u8 {
        match (self.exit, self.interpreter_status) {
            (RelayExit::Shutdown, _) => 0,
            (RelayExit::InterpreterExited, Some(code)) => (code & 0xff) as u8,
            (RelayExit::InterpreterExited, None) => 1,
        }
    }
}

/// Run the daemon until SIGINT/SIGTERM or the interpreter exits
///
/// # Errors
///
/// Any setup failure: invalid configuration, a PID file held by another
/// instance, broker client creation, an interpreter that cannot be started or
/// an unreachable guest socket.
pub fn run(options: DaemonOptions) -> RelayResult<DaemonSummary> {
    let config = &options.config;
    config.validate()?;
    if options.guest_socket.is_some() && options.output_topic.is_none() {
        return Err(RelayError::InvalidConfig(
            "guest buffers need an output topic".to_string(),
        ));
    }

    let _pidfile = PidFile::acquire(&options.pidfile)?;

    let broker_config = config.broker_config();
    let consumer = TraceConsumer::new(&broker_config, options.input_topic.clone())?;
    let producer = match &options.output_topic {
        Some(topic) => {
            let broker = KafkaBrokerBuilder::from_config(broker_config)
                .flush_timeout(config.flush_timeout())
                .build()?;
            Some((broker, topic.clone()))
        }
        None => None,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let interpreter = {
        let _enter = runtime.enter();
        Interpreter::spawn(&options.interpreter, &options.script, &options.script_args)?
    };
    let guest_source = match &options.guest_socket {
        Some(path) => Some(runtime.block_on(GuestSource::connect(path, config.mtu))?),
        None => None,
    };

    info!(
        input = %options.input_topic,
        output = options.output_topic.as_ref().map(Topic::name).unwrap_or("<stdout>"),
        security = config.broker.security.as_str(),
        guest = guest_source.is_some(),
        "Daemon starting"
    );

    let shutdown = ShutdownFlag::new();
    let (frames_tx, publisher_thread) = match producer {
        Some((broker, topic)) => {
            let (frames_tx, frames_rx) = crossbeam_channel::unbounded();
            let publisher = Publisher::new(Arc::new(broker), topic, config.queue_full_pump());
            let thread = pipeline::spawn_publisher(
                publisher,
                frames_rx,
                shutdown.clone(),
                config.poll_period(),
                config.flush_timeout(),
            )?;
            (Some(frames_tx), Some(thread))
        }
        None => (None, None),
    };

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    let consumer_thread = match pipeline::spawn_consumer(
        consumer,
        inbound_tx,
        shutdown.clone(),
        options.consumer_poll,
    ) {
        Ok(thread) => thread,
        Err(e) => {
            drop(frames_tx);
            if let Some(thread) = publisher_thread {
                join(thread);
            }
            return Err(e);
        }
    };

    let served = runtime.block_on(serve(interpreter, guest_source, inbound_rx, frames_tx));

    // Both threads observe the flag within one poll or one pump
    shutdown.trigger();
    let consumed = join(consumer_thread);
    let publisher = publisher_thread.map(join).unwrap_or_default();

    let served = served?;
    let summary = DaemonSummary {
        exit: served.exit,
        relay: served.relay,
        consumed,
        guest_buffers: served.guest_buffers,
        interpreter_status: served.status,
        publisher,
    };
    info!(
        exit = ?summary.exit,
        consumed,
        frames = summary.relay.frames,
        guest_buffers = summary.guest_buffers,
        enqueued = publisher.enqueued,
        dropped = publisher.dropped,
        "Daemon stopped"
    );
    Ok(summary)
}

/// Outcome of the async half of the daemon
struct Served {
    exit: RelayExit,
    relay: RelayStats,
    guest_buffers: u64,
    status: Option<i32>,
}

async fn serve(
    interpreter: Interpreter,
    guest_source: Option<GuestSource<UnixStream>>,
    inbound: mpsc::Receiver<Bytes>,
    outbound: Option<Sender<Frame>>,
) -> RelayResult<Served> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let on_signal = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = on_signal.send(true);
    });

    let guest_task = match (guest_source, &outbound) {
        (Some(source), Some(outbound)) => Some(tokio::spawn(guest::forward_guest(
            source,
            outbound.clone(),
            shutdown_rx.clone(),
        ))),
        _ => None,
    };

    let result = pipeline::relay(
        interpreter.stdout,
        interpreter.stdin,
        inbound,
        outbound.as_ref(),
        shutdown_rx,
    )
    .await;

    let wait = Duration::from_millis(DECOMMISSION_WAIT_MS);
    let status = match &result {
        Ok((RelayExit::InterpreterExited, _)) => pipeline::reap_interpreter(interpreter.child, wait).await,
        _ => pipeline::stop_interpreter(interpreter.child, wait).await,
    };

    // The guest forwarder stops with the interpreter
    let _ = shutdown_tx.send(true);
    let guest_buffers = match guest_task {
        Some(task) => match task.await {
            Ok(Ok(buffers)) => buffers,
            Ok(Err(e)) => {
                warn!(error = %e, "Guest buffer forwarding stopped");
                0
            }
            Err(e) => {
                warn!(error = %e, "Guest buffer task failed");
                0
            }
        },
        None => 0,
    };

    let (exit, relay) = result?;
    Ok(Served {
        exit,
        relay,
        guest_buffers,
        status: status.and_then(|s| s.code()),
    })
}

/// Resolve on the first SIGINT or SIGTERM
async fn wait_for_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, waiting for SIGINT only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "SIGINT handler unavailable");
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
}

fn join<T>(thread: JoinHandle<T>) -> T {
    match thread.join() {
        Ok(value) => value,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
