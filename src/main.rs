//! framewire: length-prefixed JSON-header messaging
//!
//! Runs as either side of a one-shot exchange:
//! - server: answers a structured search or echoes a binary request
//! - client: opens one or more connections, each sending the same request
//!
//! Configuration via CLI arguments or TOML file.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use signal_hook::consts::signal::{SIGINT, SIGTERM};
use tracing::info;
use tracing_subscriber::EnvFilter;

use framewire::config::{Config, Mode};
use framewire::protocol::Outgoing;
use framewire::runtime;

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

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop))?;
    }

    let addr = config.socket_addr()?;

    info!(
        mode = ?config.mode,
        host = %config.host,
        port = config.port,
        "Starting framewire"
    );

    match config.mode {
        Mode::Server => run_server(&config, addr, &stop),
        Mode::Client => run_client(&config, addr, &stop),
    }
}

fn run_server(
    config: &Config,
    addr: std::net::SocketAddr,
    stop: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    let stats = runtime::run_server(config, addr, stop)?;
    info!(
        accepted = stats.accepted,
        rejected = stats.rejected,
        completed = stats.completed,
        failed = stats.failed,
        "Caught interrupt, exiting"
    );
    Ok(())
}

fn run_client(
    config: &Config,
    addr: std::net::SocketAddr,
    stop: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = Outgoing::request(&config.action, &config.value)?;
    let replies = runtime::run_client(config, addr, &request, stop)?;
    for reply in &replies {
        println!("Got result: {reply}");
    }
    Ok(())
}
