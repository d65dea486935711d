use std::process;

use stampede::{
    application::{capture::run_capture, error::AppError, simulate::run_simulation},
    cache::CacheConfig,
    config,
    infra::{output, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(error = %error, chain = %report.chain(), "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = %report.chain(), "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Simulate(Box::<config::SimulateArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;
    let cache = CacheConfig::from(&settings.cache);
    info!(
        failure_backoff_base_ms = cache.failure_backoff_base_ms,
        failure_backoff_max_ms = cache.failure_backoff_max_ms,
        "Configuration loaded"
    );

    match command {
        config::Command::Simulate(_) => {
            let report = run_simulation(&settings).await?;
            output::print_json(&report, false)?;
        }
        config::Command::Capture(args) => {
            let keys = if args.keys.is_empty() {
                settings.simulate.keys.clone()
            } else {
                args.keys.clone()
            };
            let snapshot = run_capture(&settings, &keys).await?;
            output::print_json(&snapshot, args.pretty)?;
        }
    }

    Ok(())
}
