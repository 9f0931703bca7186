//! Command-line interface for depstart.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, ValueEnum};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Action to take when a service configuration error is encountered.
///
/// Governs unknown-dependency references and the autostart/dependent_startup
/// conflict. Circular dependencies are fatal regardless of this policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ErrorAction {
    /// Abort with a fatal configuration error.
    Exit,
    /// Log a warning and drop the offending edge or service handling.
    #[default]
    Skip,
    /// Same as skip.
    Ignore,
}

impl ErrorAction {
    /// Whether configuration errors abort the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorAction::Exit)
    }
}

/// Command-line interface for depstart.
#[derive(Parser)]
#[command(name = "depstart", version, author)]
#[command(
    about = "Dependency-aware startup sequencer for supervisor-managed services",
    long_about = None
)]
pub struct Cli {
    /// Path to the configuration manifest (defaults to `depstart.yaml`).
    #[arg(short, long)]
    pub config: Option<String>,

    /// The action to perform when encountering service config errors.
    #[arg(long, value_enum, default_value_t = ErrorAction::Skip)]
    pub error_action: ErrorAction,

    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<LogLevelArg>,

    /// Log to a file instead of stderr.
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
