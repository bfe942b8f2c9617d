use clap::{Parser, Subcommand};
use federation::events::{Direction, TracingEvents};
use federation::handler::{handle_download, handle_upload};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

mod config;

use config::Config;

#[derive(Parser)]
#[command(about = "Synchronises diagnosis keys with the federation gateway")]
struct Cli {
    /// YAML config file. The environment is used when omitted.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Clone, Copy)]
enum CliCommand {
    /// Publish local submissions to the gateway
    Upload,
    /// Ingest keys published by other backends
    Download,
}

impl CliCommand {
    fn direction(self) -> Direction {
        match self {
            CliCommand::Upload => Direction::Upload,
            CliCommand::Download => Direction::Download,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let direction = cli.command.direction();

    let config = match &cli.config {
        Some(path) => Config::from_file(path),
        None => Config::from_env(direction),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _sentry = match shared::telemetry::init(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error initializing logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(metrics) = &config.metrics {
        if let Err(e) = shared::metrics::init(metrics, federation::metrics_defs::ALL_METRICS) {
            tracing::error!(error = %e, "Could not initialize metrics");
            return ExitCode::FAILURE;
        }
    }

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Could not start the tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let events = Arc::new(TracingEvents);
    let result = rt.block_on(async {
        match cli.command {
            CliCommand::Upload => handle_upload(&config.federation, events).await,
            CliCommand::Download => handle_download(&config.federation, events).await,
        }
    });

    match result {
        Ok(processed) => {
            tracing::info!(%direction, processed, "Invocation complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(%direction, error = %e, "Invocation failed");
            ExitCode::FAILURE
        }
    }
}
