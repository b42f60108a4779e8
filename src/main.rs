use anyhow::{Context, Result};
use avatar_store::{
    config, db, routes,
    services::{
        backend::{ComfyBackend, SynthesisBackend},
        content_store::ContentStore,
        job_store::JobStore,
        reclamation::ReclamationScheduler,
    },
    state::AppState,
};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting avatar-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    tracing::debug!("Connecting using raw URL => {}", cfg.database_url);
    let db = Arc::new(db::connect(&cfg.database_url, 5).await?);

    // --- Schema: always ensured, `--migrate` exits afterwards ---
    db::run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize core services ---
    let store = ContentStore::new(db.clone(), cfg.storage_dir.clone())
        .with_limits(cfg.ingest_limits());

    // The sweep gets its own connection so it never competes with requests
    // for the main pool.
    let sweep_db = Arc::new(db::connect(&cfg.database_url, 1).await?);
    let scheduler = Arc::new(ReclamationScheduler::new(
        store.with_pool(sweep_db),
        cfg.reclamation_policy(),
    ));

    let backend: Arc<dyn SynthesisBackend> = Arc::new(
        ComfyBackend::new(cfg.backend_config()).context("building synthesis backend client")?,
    );
    let jobs = JobStore::new(db.clone(), store.clone(), backend);

    scheduler.start().await;

    let state = AppState::new(store, jobs, scheduler.clone());

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_upload_bytes).with_state(state);

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
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    db.close().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
