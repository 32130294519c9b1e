//! hookrelay-server - REST API server binary.

use std::net::SocketAddr;

use hookrelay_core::RelayConfig;
use hookrelay_server::{create_server, AppState};
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("hookrelay_server=debug".parse()?),
        )
        .init();

    let host = std::env::var("HOOKRELAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("HOOKRELAY_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .map_err(|e| format!("HOOKRELAY_PORT must be a valid port number: {}", e))?;

    let config = RelayConfig::load()?;
    let state = AppState::from_config(config).await?;

    // Workers, recovery and the expiry sweep
    state.runtime().start().await?;
    info!(
        workers = state.runtime().config().worker_count,
        max_tries = state.runtime().config().max_tries,
        "Relay runtime started"
    );

    let app = create_server(state.clone());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Starting hookrelay-server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            info!("Shutdown signal received, draining deliveries...");
        })
        .await?;

    // Drain the queue and stop retry timers
    state.runtime().shutdown().await?;

    info!("Server stopped cleanly");
    Ok(())
}
