pub mod api {
    pub mod error;
    pub mod handlers;
    pub mod metrics;
    pub mod schemas;
}

pub mod config;
pub mod db {
    pub mod bootstrap;
    #[cfg(test)]
    pub mod memory;
    pub mod models;
    pub mod store;
}
pub mod schema;
pub mod utils;
pub mod services {
    pub mod ingest;
}

use crate::api::handlers::{build_router, AppState};
use crate::config::{Config, LoadedEnvFile};
use crate::db::store::PgStore;
use crate::services::ingest::IngestAuth;
use log::{error, info, warn};
use std::sync::Arc;

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "aics-backend {} (git {}) starting: bind_addr={}, db_pool_size={}, ingest_auth={}",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH"),
        cfg.bind_addr,
        cfg.db_pool_size,
        if cfg.ingest_api_key.is_some() { "shared-secret" } else { "open" }
    );

    // 2) Connect DB
    let store = PgStore::connect(&cfg.database_url, cfg.db_pool_size.get())?;

    // 3) Create tables that do not exist yet
    store.bootstrap()?;

    // 4) Ingest authentication mode
    let auth = IngestAuth::from_secret(cfg.ingest_api_key.as_deref());
    if auth == IngestAuth::Open {
        warn!("AICS_INGEST_API_KEY is not set; /ingest accepts unauthenticated requests");
    }

    // 5) Serve
    let state = AppState::new(Arc::new(store), auth);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Starting async runtime failed: {}", e))?;
    runtime.block_on(serve(cfg.bind_addr, state))
}

async fn serve(addr: std::net::SocketAddr, state: AppState) -> Result<(), String> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Binding {} failed: {}", addr, e))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("HTTP server failed: {}", e))?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested; draining in-flight requests"),
        Err(e) => {
            error!("Listening for shutdown signal failed: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

fn main() {
    let args = std::env::args_os()
        .skip(1)
        .map(|a| a.into_string().map_err(|_| "argument contains invalid UTF-8".to_string()))
        .collect::<Result<Vec<_>, _>>();
    let loaded_env = match args.and_then(config::load_env_from_args) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    match loaded_env {
        Some(LoadedEnvFile { path, explicit: true }) => info!("Environment seeded from --env-file {}", path.display()),
        Some(LoadedEnvFile { path, explicit: false }) => info!("Environment seeded from {}", path.display()),
        None => info!("No .env file; using process environment only"),
    }

    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
