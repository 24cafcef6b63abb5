//! Gantry Daemon
//!
//! Translating API gateway: exposes an Anthropic-style `POST /v1/messages`
//! endpoint (JSON and SSE) and fulfills requests against an OpenAI-compatible
//! chat-completions upstream.
//!
//! HTTP API:
//! - POST /v1/messages - Anthropic Messages API, translated to the upstream
//! - GET /health - Health check
//!
//! Exit codes: 0 on graceful shutdown, 1 on startup failure.

mod config;
mod resolver;
mod server;
mod upstream;

use config::Config;
use gantry_translator::adapters::AdapterRegistry;
use resolver::ModelResolver;
use server::AppState;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Seed the environment from a file when asked; missing files are fine
    match std::env::var("GANTRY_ENV_FILE") {
        Ok(path) => {
            let _ = dotenvy::from_filename(path);
        }
        Err(_) => {
            let _ = dotenvy::dotenv();
        }
    }

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("gantry-daemon: {}", e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over LOG_LEVEL when both are set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.directive()));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    info!("gantry-daemon v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "upstream: {}{}",
        config.upstream_base_url, config.upstream_api_path
    );

    let http = match upstream::build_client() {
        Ok(c) => c,
        Err(e) => {
            error!("failed to build upstream client: {}", e);
            std::process::exit(1);
        }
    };

    let state = AppState {
        http,
        resolver: ModelResolver::single_upstream(&config),
        adapters: Arc::new(AdapterRegistry::standard()),
    };
    let app = server::router(state);

    let addr = format!("127.0.0.1:{}", config.listen_port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("server error: {}", e);
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
