use anyhow::{Context, Result};
use object_gateway::{
    config::{AppConfig, BackendKind},
    services::{
        local_storage::LocalStorage, s3_storage::S3Storage, storage_service::SharedStorage,
    },
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args()?;
    tracing::info!("Starting object-gateway with config: {:?}", cfg);

    // --- Initialize storage backend ---
    let storage: SharedStorage = match cfg.backend {
        BackendKind::S3 => Arc::new(S3Storage::connect(&cfg.s3).await),
        BackendKind::Local => Arc::new(
            LocalStorage::connect(&cfg.database_url, &cfg.storage_dir)
                .await
                .with_context(|| {
                    format!(
                        "opening local storage at {} ({})",
                        cfg.storage_dir, cfg.database_url
                    )
                })?,
        ),
    };

    // Refuse to start against an unreachable backend.
    storage
        .check()
        .await
        .map_err(|err| anyhow::anyhow!(err.verbose()))
        .context("connecting to storage backend")?;
    tracing::info!("Storage backend {:?} is reachable", cfg.backend);

    // --- Start server ---
    let listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, object_gateway::app(storage)).await?;

    Ok(())
}
