//! Entry point: wires the Store, Blob Store, Worker Pool, and RPC
//! surface together, and runs the Coordinator/Refresher as background
//! tasks reacting to Store triggers (spec.md §5/§9).

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use ceremony_coordinator::clock::SystemClock;
use ceremony_coordinator::config::CoordinatorConfig;
use ceremony_coordinator::rpc::{self, AppState};
use ceremony_coordinator::store::postgres::PostgresStore;
use ceremony_coordinator::worker::ProcessWorkerPool;
use ceremony_coordinator::{blob::S3BlobStore, coordinator, refresher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(CoordinatorConfig::from_env()?);

    let store: Arc<dyn ceremony_coordinator::store::Store> = {
        let pg = PostgresStore::connect(&config.database_url).await?;
        pg.migrate().await?;
        Arc::new(pg)
    };
    let blob: Arc<dyn ceremony_coordinator::blob::BlobStore> = Arc::new(S3BlobStore::from_env().await);
    let workers: Arc<dyn ceremony_coordinator::worker::WorkerPool> = Arc::new(ProcessWorkerPool::new());
    let clock: Arc<dyn ceremony_coordinator::clock::Clock> = Arc::new(SystemClock);

    for ceremony_id in active_ceremony_ids() {
        tokio::spawn(coordinator::run(store.clone(), clock.clone(), ceremony_id));
    }
    tokio::spawn(refresher::run(store.clone(), clock.clone()));

    let state = AppState {
        store,
        blob,
        workers,
        clock,
        config: config.clone(),
    };
    let app = rpc::create_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("ceremony coordinator listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Ceremonies this instance coordinates, read at startup. A real
/// deployment would list open ceremonies from the Store; this reads a
/// comma-separated list so a single-ceremony deployment needs no
/// extra infrastructure.
fn active_ceremony_ids() -> Vec<String> {
    std::env::var("CEREMONY_IDS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining connections");
}
