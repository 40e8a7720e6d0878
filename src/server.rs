use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    http::{HeaderName, Method, StatusCode, header},
    response::IntoResponse,
};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{self, AppState};
use crate::archive::R2LogArchive;
use crate::cleanup::Sweeper;
use crate::cloudflare::CloudflareWorkerApi;
use crate::config::Config;
use crate::db::{DbHandle, JobStore};
use crate::llm::OpenRouterClient;
use crate::sandbox::DockerRuntime;

/// Sandbox containers older than this at startup are leftovers from an
/// unclean shutdown and get pruned.
const STALE_SANDBOX_SECS: i64 = 7200;

/// Configuration for the orchestrator server process.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub dev_mode: bool,
    /// Background sweep cadence in seconds; 0 disables the internal loop
    /// (an external scheduler can run `nimbus sweep` instead).
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            db_path: std::path::PathBuf::from(".nimbus/jobs.db"),
            dev_mode: false,
            sweep_interval_secs: 3600,
        }
    }
}

/// Build the full application router: API routes, CORS, 404 fallback.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .fallback(not_found)
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static("auth")])
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "not found"})),
    )
}

/// Start the orchestrator server with production capability bindings.
pub async fn start_server(server_config: ServerConfig, config: Config) -> Result<()> {
    if let Some(parent) = server_config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let store = DbHandle::new(
        JobStore::new(&server_config.db_path).context("Failed to initialize job store")?,
    );

    let runtime = DockerRuntime::connect(config.sandbox_image.clone())
        .await
        .context("Docker daemon is not reachable; sandbox builds need it")?;
    match runtime.prune_stale(STALE_SANDBOX_SECS).await {
        Ok(pruned) if pruned > 0 => {
            eprintln!("[server] pruned {} stale sandbox containers", pruned)
        }
        Ok(_) => {}
        Err(e) => eprintln!("[server] sandbox prune failed: {:#}", e),
    }

    let archive = Arc::new(R2LogArchive::new(
        config.cloudflare_account_id.clone(),
        config.cloudflare_api_token.clone(),
        config.r2_bucket.clone(),
    ));
    let workers = Arc::new(CloudflareWorkerApi::new(
        config.cloudflare_account_id.clone(),
        config.cloudflare_api_token.clone(),
    ));
    let llm = Arc::new(OpenRouterClient::new(config.openrouter_api_key.clone()));

    let state = Arc::new(AppState {
        store: store.clone(),
        archive: archive.clone(),
        runtime: Arc::new(runtime),
        llm,
        config: Arc::new(config),
    });

    if server_config.sweep_interval_secs > 0 {
        let sweeper = Sweeper::new(store, archive, workers);
        tokio::spawn(sweeper.run_interval(Duration::from_secs(server_config.sweep_interval_secs)));
    }

    let app = build_router(state);
    let host = if server_config.dev_mode {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let addr = format!("{}:{}", host, server_config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    println!("Nimbus orchestrator running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}
