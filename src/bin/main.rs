use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::Path,
    process::ExitCode,
    sync::Mutex,
};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use depstart::{
    cli::{Cli, parse_args},
    config::load_config,
    controller::ProcessController,
    error::DependentStartupError,
    events::EventChannel,
    graph::ServiceTable,
    rpc::XmlRpcClient,
    scheduler::Scheduler,
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    if let Some(path) = &args.config {
        if !Path::new(path).exists() {
            warn!("Config file does not exist: {path}");
            return ExitCode::from(2);
        }
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            match err {
                DependentStartupError::ConfigNotFound { .. } => ExitCode::from(4),
                _ => ExitCode::from(3),
            }
        }
    }
}

fn run(args: &Cli) -> Result<(), DependentStartupError> {
    let config = load_config(args.config.as_deref())?;
    let table = ServiceTable::build(&config, args.error_action)?;

    let rpc = XmlRpcClient::from_env()?;
    let controller = ProcessController::new(rpc);
    info!(
        "Connected to supervisor with API version: {}",
        controller.api_version()?
    );

    let mut scheduler = Scheduler::new(table, controller);
    scheduler.run()?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut channel = EventChannel::new(stdin.lock(), stdout.lock());
    scheduler.listen(&mut channel)
}

/// Installs the tracing subscriber. Stdout carries the event-listener
/// protocol, so diagnostics go to stderr or, with `--log-file`, to a file.
fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path);
            match file {
                Ok(file) => {
                    let writer = Mutex::new(file);
                    let _ = tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(writer)
                        .with_ansi(false)
                        .try_init();
                }
                Err(err) => {
                    let _ = writeln!(
                        io::stderr(),
                        "failed to open log file {}: {err}",
                        path.display()
                    );
                    let _ = tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(io::stderr)
                        .try_init();
                }
            }
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .try_init();
        }
    }
}
