//! MCP Gateway
//!
//! Multiplex a pool of backend MCP servers behind one SSE endpoint.

use clap::Parser;
use mcp_gateway::config::{CliArgs, GatewaySettings};
use mcp_gateway::http::{AppState, create_router, with_optional_api_key};
use mcp_gateway::registry::ServiceRegistry;
use mcp_gateway::session_manager::SessionManager;
use std::io::{IsTerminal as _, stdout};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const GRACEFUL_SHUTDOWN_BUDGET: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();
    init_logging(&cli.log_level);

    tracing::info!("Starting MCP Gateway v{}", VERSION);

    let settings = GatewaySettings::from_cli(&cli);
    std::fs::create_dir_all(&settings.config_dir)?;

    let http = reqwest::Client::new();
    let registry = ServiceRegistry::new(settings.clone(), http.clone());
    registry.load_persisted();

    let sessions = SessionManager::new(
        Arc::clone(&registry),
        settings.gc_interval,
        settings.idle_timeout,
        http,
    );
    sessions.spawn_gc_loop();

    let state = Arc::new(AppState {
        sessions: Arc::clone(&sessions),
        api_key: cli.api_key.clone(),
    });
    let app = with_optional_api_key(create_router(Arc::clone(&state)), state);

    let addr: SocketAddr = cli
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", cli.bind, e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    let ct = CancellationToken::new();
    let server_ct = ct.clone();
    tokio::spawn(async move {
        let server =
            axum::serve(listener, app).with_graceful_shutdown(server_ct.cancelled_owned());
        if let Err(e) = server.await {
            tracing::error!(error = %e, "http server stopped with error");
        }
    });

    shutdown_signal().await;
    ct.cancel();

    if tokio::time::timeout(GRACEFUL_SHUTDOWN_BUDGET, sessions.shutdown())
        .await
        .is_err()
    {
        tracing::error!(
            "graceful shutdown exceeded {}s, aborting",
            GRACEFUL_SHUTDOWN_BUDGET.as_secs()
        );
        std::process::exit(1);
    }

    tracing::info!("Gateway shut down gracefully");
    Ok(())
}

/// Initialize logging based on the log level string.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Human-readable format on a TTY, JSON in production.
    if stdout().is_terminal() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
