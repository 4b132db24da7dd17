use std::sync::Arc;

use clap::Parser;
use tabbridge_server::{ServerConfig, UnverifiedJwtDecoder};

/// Session/transport bridge between browser tool providers and AI agents.
#[derive(Parser, Debug)]
#[command(name = "tabbridge", version, about)]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 9092)]
    port: u16,

    /// Peer round-trip timeout in seconds.
    #[arg(long, default_value_t = 15)]
    request_timeout: u64,

    /// Session idle timeout in seconds.
    #[arg(long, default_value_t = 300)]
    session_ttl: u64,

    /// Include internal error detail in gateway responses.
    #[arg(long, default_value_t = false)]
    dev_errors: bool,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!("Starting tabbridge server");

    let config = ServerConfig {
        port: cli.port,
        request_timeout_secs: cli.request_timeout,
        session_ttl_secs: cli.session_ttl,
        expose_internal_errors: cli.dev_errors,
        ..Default::default()
    };

    let handle = tabbridge_server::start(config, Arc::new(UnverifiedJwtDecoder))
        .await
        .expect("Failed to start server");

    tracing::info!(port = handle.port, "tabbridge ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");

    tracing::info!("Shutting down");
    handle.shutdown().await;
}
