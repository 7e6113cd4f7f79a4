use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::info;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use recoil_relay::Relay;

mod actor;
mod config;
mod handlers;
mod ws;

use actor::RelayHandle;
use config::{DEFAULT_CONFIG_FILE, FileConfig, ServerConfig, load_config};
use handlers::AppState;

/// Custom span maker that adds a unique request ID to each HTTP request span.
#[derive(Clone, Debug)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "recoil-relay")]
#[command(about = "Relay between Recoil-instrumented pages and devtools panels")]
struct Cli {
    /// Config file (TOML); missing files fall back to defaults
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Listen host, overrides `server.host`
    #[arg(long)]
    host: Option<String>,

    /// Listen port, overrides `server.port`
    #[arg(long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "recoil_relay=debug,relay_server=debug,tower_http=debug,info"
    } else {
        "recoil_relay=info,relay_server=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut file_config: FileConfig = load_config(&cli.config)
        .extract()
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        file_config.server.host = host;
    }
    if let Some(port) = cli.port {
        file_config.server.port = port;
    }

    let server_config = ServerConfig::from_file(&file_config.server)?;
    let relay_config = file_config.relay.to_relay_config();
    info!(
        persistence_limit = relay_config.default_persistence_limit,
        max_message_bytes = relay_config.max_message_bytes,
        "Starting Recoil DevTools relay"
    );

    let relay = RelayHandle::spawn(Relay::new(relay_config));
    let addr = server_config.addr;
    let state = AppState::new(relay, server_config);

    let app = handlers::router(state)
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Recoil relay listening on http://{}", actual_addr);
    info!("  GET    /ws                              - Page or panel port");
    info!("  GET    /api/connections                 - List connections");
    info!("  GET    /api/connections/:id/values/:key - Value at a transaction");
    info!("  GET    /health                          - Relay health");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Recoil relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        // Never resolve; the server runs until killed
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
