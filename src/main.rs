/// docflow server entry point
///
/// Serves:
/// - Definition administration at /api/definitions/*
/// - Workflow instances, task inboxes and statistics at /api/*
/// - Health check at /healthz
use docflow::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Defaults to 0.0.0.0:3004 and data/docflow.db; see DOCFLOW_* variables
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
