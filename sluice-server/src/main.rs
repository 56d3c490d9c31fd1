//! sluice-server: UDP log ingestion with a durable journal.
//!
//! Configured entirely from `SLUICE_*` environment variables; `SLUICE_LOG_LEVEL`
//! takes a tracing filter directive (default `info`).

use std::env;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sluice::{CodecRegistry, PipelineConfig};
use sluice_server::{LoggingOutput, Server, ServerSettings};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ENV_PREFIX: &str = "SLUICE";

fn main() -> ExitCode {
    let log_level = env::var("SLUICE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    let filter = match EnvFilter::try_new(&log_level) {
        Ok(filter) => filter,
        Err(err) => {
            eprintln!("Invalid SLUICE_LOG_LEVEL '{}': {}", log_level, err);
            return ExitCode::FAILURE;
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(true)
        .with_target(true)
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Unable to install log subscriber: {}", err);
        return ExitCode::FAILURE;
    }

    let settings = match ServerSettings::from_env(ENV_PREFIX) {
        Ok(settings) => settings,
        Err(err) => {
            error!("Invalid server settings: {}", err);
            return ExitCode::FAILURE;
        }
    };
    let config = match PipelineConfig::from_env(ENV_PREFIX) {
        Ok(config) => config,
        Err(err) => {
            error!("Invalid pipeline configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    if let Err(err) = ctrlc::set_handler(move || flag.store(true, Ordering::Release)) {
        error!("Unable to install signal handler: {}", err);
        return ExitCode::FAILURE;
    }

    let mut server = match Server::start(
        settings,
        config,
        CodecRegistry::with_defaults(),
        Arc::new(LoggingOutput),
    ) {
        Ok(server) => server,
        Err(err) => {
            error!("Unable to start server: {}", err);
            return ExitCode::FAILURE;
        }
    };

    server.run_until(&shutdown);
    info!("Bye");
    ExitCode::SUCCESS
}
