//! trace-relay daemon
//!
//! Consumes keyed trace frames from an input topic, feeds them to a trace
//! interpreter and publishes the interpreter's framed output to an output
//! topic, or prints it when no output topic is given. The process exits with
//! the interpreter's own status when the interpreter stops first.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use trace_relay::config::Config;
use trace_relay::daemon::{self, DaemonOptions};
use trace_relay::relay::broker::{BrokerConfig, SecurityMode, StartOffset, Topic};
use trace_relay::relay::constants::{
    DEFAULT_CONSUMER_POLL_US, DEFAULT_GUEST_SOCKET, DEFAULT_INTERPRETER, DEFAULT_PIDFILE,
};
use trace_relay::RelayResult;

#[derive(Parser, Debug)]
#[command(name = "trace-relay")]
#[command(version, about = "Relay trace frames between Kafka and a trace interpreter", long_about = None)]
struct Cli {
    /// Comma-separated list of bootstrap brokers
    #[arg(short = 'b', long = "brokers")]
    brokers: String,

    /// Topic carrying keyed trace frames
    #[arg(short = 'i', long = "intopic")]
    input_topic: String,

    /// Topic receiving the interpreter's framed output; stdout when omitted
    #[arg(short = 'o', long = "outtopic")]
    output_topic: Option<String>,

    /// CA certificate (TLS)
    #[arg(short = 'a', long = "cacert")]
    ca_cert: Option<String>,

    /// Client certificate (TLS)
    #[arg(short = 'c', long = "clientcert")]
    client_cert: Option<String>,

    /// Client private key (TLS)
    #[arg(short = 'k', long = "privkey")]
    private_key: Option<String>,

    /// Private key password (TLS)
    #[arg(short = 'p', long = "password")]
    password: Option<String>,

    /// Consumer poll interval in microseconds
    #[arg(short = 'q', long = "poll", default_value_t = DEFAULT_CONSUMER_POLL_US)]
    poll_us: u64,

    /// Debug logging
    #[arg(short = 'd', long)]
    debug: bool,

    /// Read the input topic from its first offset
    #[arg(short = 'f', long = "frombeginning")]
    from_beginning: bool,

    /// Trace script handed to the interpreter
    #[arg(short = 's', long)]
    script: PathBuf,

    /// Interpreter run as `<interpreter> -s <script> [args...]`
    #[arg(long, default_value = DEFAULT_INTERPRETER)]
    interpreter: String,

    /// Singleton-instance PID file
    #[arg(long, default_value = DEFAULT_PIDFILE)]
    pidfile: PathBuf,

    /// Also relay guest trace buffers read from this subscriber socket
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_GUEST_SOCKET)]
    guest_socket: Option<PathBuf>,

    /// Arguments passed through to the script
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    script_args: Vec<String>,
}

impl Cli {
    fn into_options(self) -> RelayResult<DaemonOptions> {
        let security = SecurityMode::from_parts(
            self.ca_cert,
            self.client_cert,
            self.private_key,
            self.password,
        );
        let start_offset = if self.from_beginning {
            StartOffset::Beginning
        } else {
            StartOffset::Stored
        };

        let config = Config {
            broker: BrokerConfig::new(&self.brokers)
                .security(security)
                .start_offset(start_offset),
            ..Config::default()
        };

        let mut options = DaemonOptions::new(config, Topic::new(&self.input_topic)?, self.script);
        options.output_topic = self.output_topic.as_deref().map(Topic::new).transpose()?;
        options.guest_socket = self.guest_socket;
        options.interpreter = self.interpreter;
        options.script_args = self.script_args;
        options.consumer_poll = Duration::from_micros(self.poll_us);
        options.pidfile = self.pidfile;
        Ok(options)
    }
}

fn init_tracing(debug: bool) {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.into_options().and_then(daemon::run) {
        Ok(summary) => {
            info!(
                exit = ?summary.exit,
                status = ?summary.interpreter_status,
                "Clean shutdown"
            );
            ExitCode::from(summary.exit_code())
        }
        Err(e) => {
            error!(error = %e, "Setup failed");
            ExitCode::FAILURE
        }
    }
}
