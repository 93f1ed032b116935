use anyhow::{Context, Result};
use axum::Router;
use image_vault::{
    config::{AppConfig, RunMode},
    context::PipelineContext,
    routes,
    services::{optimizer_client::OptimizerClient, storage_service::ObjectStore},
    state::AppState,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, time::MissedTickBehavior};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting image-vault with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {:?}", parent))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("invalid database url {}", db_url))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    ObjectStore::migrate(&db).await?;

    let ctx = PipelineContext::new(cfg.cache_capacity);
    let store = ObjectStore::new(db.clone(), ctx.clone(), cfg.store_settings());

    match mode {
        RunMode::Migrate => {
            tracing::info!("Database migration complete.");
            return Ok(());
        }
        RunMode::Sweep => {
            let removed = store.sweep().await?;
            tracing::info!(removed, "Retention sweep complete.");
            return Ok(());
        }
        RunMode::Serve => {}
    }

    // --- Initialize pipeline ---
    let optimizer = OptimizerClient::spawn(
        ctx.clone(),
        cfg.encoder(),
        Duration::from_secs(cfg.probe_interval_secs),
    );
    spawn_sweeper(
        store.clone(),
        ctx.clone(),
        Duration::from_secs(cfg.sweep_interval_secs),
    );

    let cfg = Arc::new(cfg);
    let state = AppState {
        store,
        optimizer,
        ctx: ctx.clone(),
        config: cfg.clone(),
    };

    // --- Build router ---
    let app: Router = routes::routes::routes(&cfg).with_state(state);

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
        .with_graceful_shutdown(shutdown_signal(ctx))
        .await?;

    Ok(())
}

/// Periodic retention sweep; stops with the pipeline.
fn spawn_sweeper(store: ObjectStore, ctx: PipelineContext, every: Duration) {
    let shutdown = ctx.shutdown_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match store.sweep().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "expired images swept"),
                    Err(err) => tracing::error!(error = %err, "retention sweep failed"),
                },
            }
        }
    });
}

async fn shutdown_signal(ctx: PipelineContext) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
    }
    ctx.shutdown();
}
