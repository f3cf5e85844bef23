use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use transfer_relay::{
    backends::{metadata_store::SqliteMetadataStore, object_store::FsObjectStore},
    clock::SystemClock,
    config::AppConfig,
    routes::routes::routes,
    services::{
        lifecycle::LifecycleManager, query::QueryService, reaper::ExpiryReaper,
        relay::RelayService,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting transfer-relay with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // Multipart uploads are spooled here until the whole form is read
    let staging_dir = Path::new(&cfg.storage_dir).join(".staging");
    fs::create_dir_all(&staging_dir)
        .with_context(|| format!("creating staging directory {}", staging_dir.display()))?;

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let db_path = db_path.split('?').next().unwrap_or(db_path);
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if db_path != ":memory:" {
        // SQLite will not create missing parent directories or the file itself
        let db_path_obj = Path::new(db_path);
        if let Some(parent) = db_path_obj.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
        if let Err(e) = fs::OpenOptions::new().create(true).append(true).open(db_path) {
            tracing::warn!("Failed to open database file {}: {}", db_path, e);
        }
    }

    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .with_context(|| format!("connecting to {db_url}"))?,
    );
    let metadata = Arc::new(SqliteMetadataStore::new(db.clone()));

    // --- Handle migration mode ---
    if migrate {
        metadata.migrate().await.context("running migrations")?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let objects = Arc::new(FsObjectStore::new(&cfg.storage_dir));
    let clock = Arc::new(SystemClock);
    let lifecycle_cfg = cfg.lifecycle_config();
    let retry = lifecycle_cfg.retry.clone();

    let lifecycle = Arc::new(LifecycleManager::new(
        metadata.clone(),
        objects.clone(),
        Arc::new(cfg.upload_policy()),
        clock.clone(),
        lifecycle_cfg,
    ));
    let query = QueryService::new(metadata.clone(), clock, retry);
    let relay = RelayService::new(
        lifecycle.clone(),
        metadata.clone(),
        objects,
        query,
        cfg.public_base_url.clone(),
        cfg.max_file_size_bytes(),
    )
    .with_staging_dir(staging_dir);

    // --- Start reaper ---
    let shutdown = CancellationToken::new();
    let reaper = ExpiryReaper::new(lifecycle, metadata, cfg.reaper_config());
    let reaper_task = tokio::spawn(reaper.run(shutdown.child_token()));

    // --- Build router ---
    let app: Router = routes(cfg.max_file_size_bytes()).with_state(relay);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(err) = reaper_task.await {
        tracing::warn!("Reaper task ended abnormally: {}", err);
    }
    tracing::info!("Shut down cleanly");

    Ok(())
}

/// Resolve on Ctrl-C, or when something else already cancelled `token`.
async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!("Failed to listen for shutdown signal: {}", err);
                token.cancelled().await;
                return;
            }
            tracing::info!("Shutdown signal received");
        }
        _ = token.cancelled() => {}
    }
}
