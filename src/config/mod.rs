//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU32, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{DEFAULT_FAILURE_BACKOFF_BASE_MS, DEFAULT_FAILURE_BACKOFF_MAX_MS};

mod cli;

pub use cli::{
    CacheOverrides, CaptureArgs, CliArgs, Command, LoggingOverrides, SimulateArgs,
    SimulateOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "stampede";
const DEFAULT_SIMULATE_OBSERVERS: u32 = 8;
const DEFAULT_SIMULATE_PRODUCER_DELAY_MS: u64 = 50;
const DEFAULT_SIMULATE_KEYS: [&str; 3] = ["/a", "/b", "/c"];

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub simulate: SimulateSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Zero disables the failure backoff.
    pub failure_backoff_base: Duration,
    pub failure_backoff_max: Duration,
}

#[derive(Debug, Clone)]
pub struct SimulateSettings {
    pub observers: NonZeroU32,
    pub keys: Vec<String>,
    pub producer_delay: Duration,
    /// Every Nth production fails; `None` never fails.
    pub failure_every: Option<NonZeroU32>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("STAMPEDE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("simulate.keys")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Simulate(args)) => raw.apply_simulate_overrides(&args.overrides),
        Some(Command::Capture(args)) => raw.apply_capture_overrides(args),
        None => raw.apply_simulate_overrides(&SimulateOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    simulate: RawSimulateSettings,
}

impl RawSettings {
    fn apply_simulate_overrides(&mut self, overrides: &SimulateOverrides) {
        self.apply_logging_overrides(&overrides.logging);
        self.apply_cache_overrides(&overrides.cache);

        if let Some(observers) = overrides.observers {
            self.simulate.observers = Some(observers);
        }
        if !overrides.keys.is_empty() {
            self.simulate.keys = Some(overrides.keys.clone());
        }
        if let Some(delay) = overrides.producer_delay_ms {
            self.simulate.producer_delay_ms = Some(delay);
        }
        if let Some(every) = overrides.failure_every {
            self.simulate.failure_every = Some(every);
        }
    }

    fn apply_capture_overrides(&mut self, args: &CaptureArgs) {
        self.apply_logging_overrides(&args.logging);
        if !args.keys.is_empty() {
            self.simulate.keys = Some(args.keys.clone());
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(base) = overrides.failure_backoff_base_ms {
            self.cache.failure_backoff_base_ms = Some(base);
        }
        if let Some(max) = overrides.failure_backoff_max_ms {
            self.cache.failure_backoff_max_ms = Some(max);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            simulate,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let simulate = build_simulate_settings(simulate)?;

        Ok(Self {
            logging,
            cache,
            simulate,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let base_ms = cache
        .failure_backoff_base_ms
        .unwrap_or(DEFAULT_FAILURE_BACKOFF_BASE_MS);
    let max_ms = cache
        .failure_backoff_max_ms
        .unwrap_or(DEFAULT_FAILURE_BACKOFF_MAX_MS);

    if base_ms > 0 && max_ms < base_ms {
        return Err(LoadError::invalid(
            "cache.failure_backoff_max_ms",
            format!("must be at least failure_backoff_base_ms ({base_ms})"),
        ));
    }

    Ok(CacheSettings {
        failure_backoff_base: Duration::from_millis(base_ms),
        failure_backoff_max: Duration::from_millis(max_ms),
    })
}

fn build_simulate_settings(simulate: RawSimulateSettings) -> Result<SimulateSettings, LoadError> {
    let observers = non_zero_u32(
        simulate.observers.unwrap_or(DEFAULT_SIMULATE_OBSERVERS),
        "simulate.observers",
    )?;

    let keys: Vec<String> = match simulate.keys {
        Some(keys) => keys
            .into_iter()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .collect(),
        None => DEFAULT_SIMULATE_KEYS.iter().map(|key| key.to_string()).collect(),
    };
    if keys.is_empty() {
        return Err(LoadError::invalid(
            "simulate.keys",
            "at least one key is required",
        ));
    }

    let producer_delay = Duration::from_millis(
        simulate
            .producer_delay_ms
            .unwrap_or(DEFAULT_SIMULATE_PRODUCER_DELAY_MS),
    );
    let failure_every = NonZeroU32::new(simulate.failure_every.unwrap_or(0));

    Ok(SimulateSettings {
        observers,
        keys,
        producer_delay,
        failure_every,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    failure_backoff_base_ms: Option<u64>,
    failure_backoff_max_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSimulateSettings {
    observers: Option<u32>,
    keys: Option<Vec<String>>,
    producer_delay_ms: Option<u64>,
    failure_every: Option<u32>,
}

fn non_zero_u32(value: u32, key: &'static str) -> Result<NonZeroU32, LoadError> {
    NonZeroU32::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
