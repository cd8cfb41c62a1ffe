//! fingerd: a finger server backed by a management attribute directory
//!
//! Protocol:
//! - The client sends one query line: `[/W ]target[@host[:port]]`
//! - The server replies with `\r\n`-separated lines and closes
//!
//! Queries:
//! - empty target: list every object name in the directory
//! - `name`: every attribute of the object as `key: value`
//! - `name#attribute`: a single attribute
//!
//! Features:
//! - Per-connection idle and query deadlines
//! - In-process directory stores declared in the TOML config
//! - Live server statistics published as a managed object
//! - Configuration via CLI arguments or TOML file

mod backend;
mod config;
mod connection;
mod directory;
mod protocol;
mod response;
mod server;
mod stats;
mod timeout;
mod timer;

use backend::DirectoryBackend;
use config::Config;
use directory::LocalDirectory;
use server::{shutdown_signal, Server};
use stats::ServerStats;
use std::sync::Arc;
use timer::TokioScheduler;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        fallback_port = ?config.fallback_port,
        workers = config.workers,
        max_query_wait_ms = config.timeouts.max_query_wait.as_millis() as u64,
        max_idle_read_ms = config.timeouts.max_idle_read.as_millis() as u64,
        directory_host = %config.directory.default_host,
        "Starting fingerd"
    );

    // Directory lookups block, so they get their own bounded pool
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.workers)
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let stats = ServerStats::new();

    let mut directory = LocalDirectory::from_config(&config.directory)?;
    directory
        .store_or_insert(&config.directory.default_host, config.directory.default_port)
        .register(stats.managed_object()?);

    let backend = DirectoryBackend::new(Arc::new(directory), &config.directory.default_host)
        .with_default_port(config.directory.default_port);

    let server = Server::new(
        config,
        Arc::new(backend),
        Arc::new(TokioScheduler::current()),
        stats,
    );
    server.run(shutdown_signal()).await?;

    Ok(())
}
