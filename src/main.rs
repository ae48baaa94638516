//! echod - A TCP Byte-Echo Server
//!
//! This is the main entry point for the echod server.
//! It loads configuration, sets up logging, binds the listener and runs the
//! accept loop until Ctrl+C or a fatal transport error.

use anyhow::Context;
use echod::config::Config;
use echod::connection::ConnectionStats;
use echod::runtime::TokioRuntime;
use echod::server::Listener;
use echod::transport::tcp::TcpTransport;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_banner(config: &Config) {
    println!(
        r#"
echod v{} - TCP Byte-Echo Server
──────────────────────────────────────────────────────────────
Listening on {}:{} (backlog {})
Every byte received is sent straight back to its sender.

Use Ctrl+C to shutdown.
"#,
        echod::VERSION,
        config.host,
        config.port,
        config.backlog
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments and the optional config file
    let config = Config::load()?;

    // Set up logging; RUST_LOG wins over the configured level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let listener_config = config.listener_config()?;

    info!(
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        buffer_size = config.buffer_size,
        recv_timeout_ms = config.recv_timeout_ms,
        send_timeout_ms = config.send_timeout_ms,
        shutdown_deadline_ms = config.shutdown_deadline_ms,
        "Starting echod"
    );

    let stats = Arc::new(ConnectionStats::new());

    // Without a listening socket there is nothing to do
    let listener = Listener::start(&TcpTransport, listener_config, TokioRuntime, Arc::clone(&stats))
        .context("failed to create listening endpoint")?;

    print_banner(&config);

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    let result = tokio::select! {
        result = listener.run() => result,
        _ = shutdown => Ok(()),
    };

    let snapshot = stats.snapshot();
    info!(
        accepted = snapshot.connections_accepted,
        active = snapshot.active_connections,
        bytes_echoed = snapshot.bytes_echoed,
        "Server shutdown complete"
    );

    if let Err(ref e) = result {
        error!(error = %e, "Listener stopped on a fatal error");
    }
    result.context("accept loop failed")
}
