//! Binary entry-point for the UDS tunnel relay.

mod admin;
mod broker;
mod config;
mod error;
mod failguard;
mod listener;
mod proto;
mod session;
mod stats;
mod ticket;
mod tls;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

use error::ConfigError;
use listener::Listener;

/// Process exit codes: 0 clean shutdown, 1 configuration error,
/// 2 bind failure, 3 TLS material error.
const EXIT_OK: i32 = 0;
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_BIND_FAILURE: i32 = 2;
const EXIT_TLS_ERROR: i32 = 3;

#[tokio::main]
async fn main() {
    let cli = config::Cli::parse();

    let cfg = match config::load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    init_logging(&cfg.log_level, &cfg.log_file);

    info!("Configuration loaded from {:?}", cli.config);
    info!("Listen   : {}", cfg.listen_address());
    info!("Upstream : {}", cfg.uds_server);

    let listener = match Listener::new(cfg) {
        Ok(listener) => listener,
        Err(e @ ConfigError::Tls(_)) => {
            error!("TLS material error: {e}");
            std::process::exit(EXIT_TLS_ERROR);
        }
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let bound = match listener.bind().await {
        Ok(bound) => bound,
        Err(e) => {
            error!("failed to bind listening socket: {e}");
            std::process::exit(EXIT_BIND_FAILURE);
        }
    };

    if let Err(e) = listener.run(bound).await {
        error!("listener exited with error: {:?}", e);
    }

    std::process::exit(EXIT_OK);
}

/// Structured logging setup. `log_file = "-"` (the default) logs to
/// stderr; any other value also writes a rolling file appender alongside
/// it.
fn init_logging(log_level: &str, log_file: &str) {
    let level = log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    if log_file == "-" {
        fmt().with_env_filter(env_filter).init();
    } else {
        let file_appender = tracing_appender::rolling::never(".", log_file);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Leak the guard: it must live for the process lifetime to keep
        // flushing, and the process only ever exits via std::process::exit.
        Box::leak(Box::new(guard));
        fmt().with_env_filter(env_filter).with_writer(non_blocking).init();
    }
}
