//! discard-server: accepts TCP connections and drops every byte it receives.
//!
//! Configuration via a positional port, CLI flags or a TOML file. Runs until
//! killed.

use discard_server::config::Config;
use discard_server::{DiscardHandler, PipelineBuilder, ServerBootstrap};
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

    let port = config.port;
    let options = config.into_options()?;

    info!(
        host = %options.host,
        port,
        acceptors = options.acceptor_threads,
        workers = options.worker_threads,
        backlog = options.backlog,
        keep_alive = options.keep_alive,
        "Starting discard server"
    );

    let server = ServerBootstrap::new(options).child_handler(
        |pipeline: &mut PipelineBuilder| -> discard_server::Result<()> {
            pipeline.add_last(DiscardHandler::new());
            Ok(())
        },
    );

    let addr = server.start(port)?;
    info!(addr = %addr, "Discard server ready");

    server.await_termination()?;
    Ok(())
}
