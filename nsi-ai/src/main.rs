//! nsi-ai - Catalog normalization service
//!
//! Classifies nomenclature and counterparty records against reference tables,
//! curated benchmarks and AI providers. HTTP REST + SSE on `[server] bind`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nsi_ai::db::{init_database_pool, SqliteStore};
use nsi_ai::repository::Repositories;
use nsi_ai::{AppState, ContainerBuilder};
use nsi_common::config::{load_toml_config, resolve_root_folder, CONFIG_FILE_NAME, DATABASE_FILE_NAME};
use nsi_common::events::EventBus;

/// Command-line arguments for nsi-ai
#[derive(Parser, Debug)]
#[command(name = "nsi-ai")]
#[command(about = "Catalog and counterparty normalization service")]
#[command(version)]
struct Args {
    /// Folder holding nsi-ai.toml and the database
    #[arg(short, long, env = "NSI_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Listen address, overriding `[server] bind`
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Step 1: Resolve root folder and load its config
    let root_folder = resolve_root_folder(args.root_folder.as_deref(), "NSI_ROOT_FOLDER");
    std::fs::create_dir_all(&root_folder)
        .with_context(|| format!("Failed to create root folder {}", root_folder.display()))?;
    let config_path = root_folder.join(CONFIG_FILE_NAME);
    let config = load_toml_config(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    // Step 2: Tracing (RUST_LOG wins over [logging] level)
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting nsi-ai (catalog normalization) service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Root folder: {}", root_folder.display());

    // Step 3: Open or create database
    let db_path = root_folder.join(DATABASE_FILE_NAME);
    info!("Database: {}", db_path.display());
    let pool = init_database_pool(&db_path)
        .await
        .context("Failed to open database")?;
    let repositories = Repositories::from_store(Arc::new(SqliteStore::new(pool)));

    // Step 4: Build services
    let event_bus = EventBus::new(256);
    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let container = Arc::new(
        ContainerBuilder::new(config, repositories, event_bus)
            .build()
            .await
            .context("Failed to build services")?,
    );
    if container.gateway.provider_count() == 0 {
        warn!("No AI providers configured; unresolved records go to manual review");
    }

    let state = AppState::new(container.clone());

    // Step 5: Pick up jobs a previous run left active
    match container.jobs.resume_interrupted().await {
        Ok(ids) if !ids.is_empty() => info!(count = ids.len(), "Interrupted jobs handled"),
        Ok(_) => {}
        Err(e) => {
            error!("Failed to resume interrupted jobs: {}", e);
            state.record_error(format!("resume on startup failed: {}", e)).await;
        }
    }

    // Step 6: Serve
    let app = nsi_ai::build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;
    info!("Listening on http://{}", bind);
    info!("Health check: http://{}/health", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    container.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
