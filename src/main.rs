use anyhow::Result;
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod client;
mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use config::{AppConfig, Command};
use services::{
    AppState, chunk_store::ChunkStore, link_service::LinkService,
    session_service::SessionService,
};

const GC_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (cfg, command) = AppConfig::from_env_and_args()?;

    match command {
        Command::Serve => serve(cfg).await,
        Command::Migrate => {
            let db = connect(&cfg).await?;
            run_migrations(&db).await?;
            tracing::info!("Database migration complete.");
            Ok(())
        }
        Command::Upload {
            file,
            url,
            chunk_size,
            concurrency,
            api_key,
        } => upload(&file, &url, chunk_size, concurrency, api_key).await,
    }
}

async fn serve(cfg: AppConfig) -> Result<()> {
    tracing::info!("Starting share-store with config: {:?}", cfg);

    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    let db = connect(&cfg).await?;
    // The schema only uses IF NOT EXISTS statements, so applying it at
    // startup is idempotent.
    run_migrations(&db).await?;

    let store = ChunkStore::new(cfg.storage_dir.clone());
    let sessions = SessionService::new(
        db.clone(),
        store,
        cfg.session_ttl_minutes,
        cfg.session_retention_minutes,
        cfg.sync_finalize_max_bytes,
    );
    let links = LinkService::new(db.clone(), cfg.token_secret.clone());

    let gc = sessions.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(GC_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = gc.gc_tick().await {
                tracing::warn!("garbage collection pass failed: {err}");
            }
        }
    });

    let state = AppState { sessions, links };
    let app: Router = routes::routes::routes().with_state(state);

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
    axum::serve(listener, app).await?;

    Ok(())
}

/// Open the SQLite pool, creating the database file's parent directory
/// when needed.
async fn connect(cfg: &AppConfig) -> Result<Arc<sqlx::SqlitePool>> {
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    // SQLx will not create the file itself unless asked via the URL;
    // touching it here keeps plain `sqlite://path` URLs working.
    if !Path::new(db_path).exists() {
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(db_path)?;
    }

    Ok(Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    ))
}

/// Run SQLite migrations manually from the embedded SQL file.
async fn run_migrations(db: &Arc<sqlx::SqlitePool>) -> Result<()> {
    let sql = include_str!("../migrations/0001_init.sql");
    let statements = sql
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(&**db).await?;
    }

    Ok(())
}

/// Drive the chunk scheduler against a running server and print
/// progress to stderr.
async fn upload(
    file: &str,
    url: &str,
    chunk_size: u64,
    concurrency: usize,
    api_key: Option<String>,
) -> Result<()> {
    use client::{
        http_transport::HttpTransport,
        scheduler::{Progress, Scheduler},
    };
    use tokio::sync::mpsc;

    let (tx, mut rx) = mpsc::unbounded_channel::<Progress>();
    let reporter = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            let eta = progress
                .eta_secs
                .map(|secs| format!("{:.0}s", secs))
                .unwrap_or_else(|| "?".into());
            eprintln!(
                "uploaded {}/{} chunks ({:.1} MiB/s, eta {})",
                progress.uploaded_chunks,
                progress.total_chunks,
                progress.bytes_per_sec / (1024.0 * 1024.0),
                eta
            );
        }
    });

    let scheduler = Scheduler::new(HttpTransport::new(url, api_key))
        .with_concurrency(concurrency)
        .with_progress(tx);
    let file_id = scheduler.upload_file(Path::new(file), chunk_size).await?;
    // Dropping the scheduler closes the progress channel so the
    // reporter can drain and exit.
    drop(scheduler);
    reporter.await?;

    println!("{file_id}");
    Ok(())
}
