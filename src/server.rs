/// Server setup and initialization
///
/// Wires together storage, the definition store, the workflow engine, the
/// timeout sweeper and HTTP routes.

use crate::{
    api::{create_api_routes, AppState},
    config::Config,
    instance::storage::InstanceStorage,
    runtime::{
        actions::ActionRegistry,
        assignee::{AssigneeResolver, Directory, StaticDirectory},
        engine::WorkflowEngine,
        notify::{NotificationGateway, WebhookSink},
        sweeper::{SweepScheduler, TimeoutSweeper},
    },
    store::Database,
    workflow::{registry::DefinitionStore, storage::DefinitionStorage},
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Build the engine and its collaborators on an open database
pub async fn build_state(database: &Database, config: &Config) -> Result<AppState> {
    tracing::info!("📊 Initializing definition store");
    let definitions = Arc::new(DefinitionStore::new(DefinitionStorage::new(
        database.pool().clone(),
    )));
    definitions
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load definitions from storage: {}", e))?;

    if config.engine.seed_defaults {
        definitions
            .seed_defaults()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to seed default definitions: {}", e))?;
    }

    let directory: Option<Arc<dyn Directory>> = match &config.engine.directory_file {
        Some(path) => {
            tracing::info!("👥 Loading assignee directory: {}", path);
            Some(Arc::new(StaticDirectory::from_file(path)?))
        }
        None => None,
    };

    let notifier = match &config.engine.notify_webhook_url {
        Some(url) => {
            tracing::info!("📣 Delivering notifications to {}", url);
            NotificationGateway::new(Arc::new(WebhookSink::new(url.clone())))
        }
        None => NotificationGateway::default(),
    };

    tracing::info!("🚀 Initializing workflow engine");
    let engine = Arc::new(
        WorkflowEngine::new(
            definitions,
            InstanceStorage::new(database.pool().clone()),
            AssigneeResolver::new(directory),
            ActionRegistry::with_defaults(),
            notifier,
        )
        .with_max_conflict_retries(config.engine.max_conflict_retries),
    );
    let sweeper = Arc::new(TimeoutSweeper::new(Arc::clone(&engine)));

    Ok(AppState { engine, sweeper })
}

/// Router over an already-built state
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .merge(create_api_routes().with_state(state))
}

/// Create the main Axum application and start the background sweeper
pub async fn create_app(config: Config) -> Result<Router> {
    let database = Database::open(&config.database.path).await?;
    let state = build_state(&database, &config).await?;

    tracing::info!("⏰ Initializing timeout sweeper");
    let scheduler = Arc::new(
        SweepScheduler::new(Arc::clone(&state.sweeper))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize sweep scheduler: {}", e))?,
    );
    let schedule = config.engine.sweep_schedule.clone();
    tokio::spawn(async move {
        if let Err(e) = scheduler.start(&schedule).await {
            tracing::error!("❌ Failed to start timeout sweeper: {}", e);
        }
    });

    tracing::info!("📡 Creating HTTP router");
    let app = build_router(state);

    tracing::info!("✅ Application initialized successfully");
    Ok(app)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting docflow server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
