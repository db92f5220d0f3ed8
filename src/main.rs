//! chat-db-orchestrator - main entry point.
//!
//! Serves the session manager over newline-delimited JSON on stdio. Logs go
//! to stderr so stdout carries protocol lines only.

use chat_db_orchestrator::config::Config;
use chat_db_orchestrator::manager::Manager;
use chat_db_orchestrator::stream::BroadcastStreamHandler;
use chat_db_orchestrator::transport::{StdioTransport, Transport};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    let manager_config = config.manager_config();
    info!(
        row_limit = config.effective_row_limit(),
        idle_timeout_secs = manager_config.idle_timeout.as_secs(),
        execution_ceiling_secs = manager_config.execution_ceiling.as_secs(),
        "Starting chat-db-orchestrator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let stream = Arc::new(BroadcastStreamHandler::new(config.event_buffer));
    let manager = Manager::with_defaults(manager_config, config.effective_row_limit(), stream.clone());
    manager.start();

    let transport = StdioTransport::new(manager, stream);
    info!(transport = transport.name(), "Transport ready");

    if let Err(e) = transport.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
