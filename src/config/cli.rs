use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the Stampede binary.
#[derive(Debug, Default, Parser)]
#[command(
    name = "stampede",
    version,
    about = "Coalescing cache engine with a simulation host"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "STAMPEDE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Drive concurrent observers and mutations against a synthetic producer.
    Simulate(Box<SimulateArgs>),
    /// Produce every key once, settle all productions and print the snapshot.
    Capture(CaptureArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub overrides: SimulateOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the backoff after a key's first failure; 0 disables backoff.
    #[arg(long = "failure-backoff-base-ms", value_name = "MILLIS")]
    pub failure_backoff_base_ms: Option<u64>,

    /// Override the upper bound of the failure backoff.
    #[arg(long = "failure-backoff-max-ms", value_name = "MILLIS")]
    pub failure_backoff_max_ms: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SimulateOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Override the number of observers per key.
    #[arg(long = "observers", value_name = "COUNT")]
    pub observers: Option<u32>,

    /// Override the simulated keys (repeatable).
    #[arg(long = "key", value_name = "KEY")]
    pub keys: Vec<String>,

    /// Override the synthetic producer latency.
    #[arg(long = "producer-delay-ms", value_name = "MILLIS")]
    pub producer_delay_ms: Option<u64>,

    /// Fail every Nth production; 0 never fails.
    #[arg(long = "failure-every", value_name = "N")]
    pub failure_every: Option<u32>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CaptureArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Pretty-print the snapshot.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub pretty: bool,

    /// Keys to capture; defaults to the configured simulation keys.
    #[arg(value_name = "KEY")]
    pub keys: Vec<String>,
}
