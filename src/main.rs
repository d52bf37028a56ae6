//! Shutter Authority
//!
//! Reference upload authority for the Shutter chunked upload pipeline.
//! Issues upload sessions, accepts checksummed chunks and answers
//! verification queries.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shutter_upload::authority::{self, AuthoritySettings, ReferenceAuthority};
use shutter_upload::config::Config;

/// How often expired sessions and abandoned batches are swept
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "shutter_upload=debug,shutter_authority=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Shutter Authority v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Public URL: {}", config.server.public_url);
    tracing::info!(
        "Session TTL: {}s, chunk ceiling: {} bytes, retries per chunk: {}",
        config.server.session_ttl_secs,
        config.server.max_chunk_size,
        config.server.allowed_retries
    );

    let authority = ReferenceAuthority::new(AuthoritySettings::from(&config.server));
    let _cleanup = authority.clone().start_cleanup_task(SESSION_CLEANUP_INTERVAL);

    let app = authority::app(authority);

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;
    tracing::info!("Shutter Authority listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
