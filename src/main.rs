//! graceful-demo - a slow HTTP server that shuts down gracefully
//!
//! Usage:
//!     graceful-demo [--config <path>] [--listen <addr>] [--timeout <duration>]
//!
//! Send SIGINT, SIGHUP, SIGQUIT or SIGTERM while a request is in flight: the
//! request still completes, new connections are refused.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};

use graceful_shutdown::config::{load_config, validate_config, Config};
use graceful_shutdown::http::HttpServer;
use graceful_shutdown::util::{init_logging, SIGNALS_TO_LISTEN_TO};
use graceful_shutdown::Server;

/// A slow HTTP server demonstrating graceful shutdown.
#[derive(Parser, Debug)]
#[command(name = "graceful-demo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Override the listen address
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Override the shutdown timeout (e.g. "10s", "1m")
    #[arg(short, long, value_name = "DURATION")]
    timeout: Option<humantime::Duration>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path).with_context(|| {
            format!("failed to load configuration from '{}'", path.display())
        })?,
        None => Config::default(),
    };

    // CLI overrides config
    if let Some(level) = &cli.log_level {
        config.global.log_level = level.clone();
    }
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if let Some(timeout) = cli.timeout {
        config.shutdown.timeout = timeout.into();
    }
    validate_config(&config)
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;

    init_logging(&config.global.log_level, &config.global.log_format);

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Listen: {}", config.server.listen);
        println!("  Delay: {}", humantime::format_duration(config.server.delay));
        println!(
            "  Shutdown timeout: {}",
            humantime::format_duration(config.shutdown.timeout)
        );
        return Ok(());
    }

    run(config)
}

/// Run the demo server with the given configuration.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async { run_async(config).await })
}

async fn run_async(config: Config) -> Result<()> {
    let http = HttpServer::bind(&config.server)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;

    info!(
        listen = %http.local_addr(),
        delay = %humantime::format_duration(config.server.delay),
        timeout = %humantime::format_duration(config.shutdown.timeout),
        signals = ?SIGNALS_TO_LISTEN_TO.map(|s| s.name()),
        "graceful-demo starting"
    );

    let mut server = Server::with_options(http, config.shutdown.options());

    match server.listen().await {
        Ok(()) => {
            info!("shutdown gracefully, all responses were sent");
            Ok(())
        }
        Err(e) => {
            // Usually a response was not written before the deadline; there
            // is nothing left to do but report it.
            error!(error = %e, "did not shut down gracefully, some responses may have been lost");
            Err(e).context("graceful shutdown failed")
        }
    }
}
