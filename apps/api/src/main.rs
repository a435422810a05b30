mod config;
mod db;
mod dispatcher;
mod errors;
mod ledger;
mod llm_client;
mod models;
mod pipeline;
mod render;
mod routes;
mod state;
mod storage;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::db::{create_pool, run_migrations};
use crate::dispatcher::queue::RedisQueue;
use crate::dispatcher::Dispatcher;
use crate::ledger::PgLedger;
use crate::llm_client::backends::BackendRegistry;
use crate::llm_client::resolve::BackendCatalog;
use crate::llm_client::{GenerationAdapter, LlmClient};
use crate::pipeline::Orchestrator;
use crate::render::RenderService;
use crate::routes::build_router;
use crate::state::AppState;
use crate::storage::ArtifactStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Tailor API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let db = create_pool(&config.database_url).await?;
    run_migrations(&db).await?;

    // Initialize Redis
    let redis = redis::Client::open(config.redis_url.clone())?;
    let queue = RedisQueue::connect(
        redis,
        config.task_queue_key.clone(),
        config.worker_id.clone(),
    )
    .await?;
    info!(
        "Redis task queue ready ({}, worker id {})",
        config.task_queue_key, config.worker_id
    );

    // Artifact store and typesetting
    let store = ArtifactStore::new(config.data_dir.clone());
    let renderer = RenderService::new(store.clone(), config.render.clone());
    info!(
        "Artifact store at {} (render command: {})",
        config.data_dir.display(),
        config.render.command
    );

    // Generation backends
    let llm = LlmClient::new(config.generation.clone())?;
    let adapter = GenerationAdapter::new(BackendRegistry::with_defaults(llm));
    let catalog = BackendCatalog::load(&config.backend_catalog_path)?;

    let orchestrator = Orchestrator::new(
        Arc::new(PgLedger::new(db)),
        store,
        renderer,
        adapter,
        Arc::new(catalog),
    );
    let dispatcher = Dispatcher::new(orchestrator.clone(), Arc::new(queue));

    let shutdown = Arc::new(AtomicBool::new(false));
    let workers = dispatcher
        .spawn_workers(config.worker_concurrency, shutdown.clone())
        .await?;
    if workers.is_empty() {
        warn!("WORKER_CONCURRENCY is 0; queued jobs will wait for an external worker");
    }

    // Build app state
    let state = AppState {
        orchestrator,
        dispatcher,
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    // Workers finish their current job before exiting.
    for worker in workers {
        if let Err(e) = worker.await {
            warn!("Worker exited abnormally: {e}");
        }
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: Arc<AtomicBool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
    shutdown.store(true, Ordering::Release);
}
