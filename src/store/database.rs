//! SQLite connection management and schema
//!
//! One database holds both logical collections:
//! - `workflow_definitions`: one row per template, unique by name
//! - `workflow_instances` + `workflow_tasks`: instance aggregates and their
//!   pending-task child rows, used for per-principal task queries

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// Owner of the engine's connection pool
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database file and initialize the schema
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("Failed to create data directory '{}': {}", parent.display(), e)
            })?;
        }

        tracing::info!("🗄️ Opening workflow database: {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        let database = Self { pool };
        database.init_schema().await?;

        tracing::info!("✅ Workflow database ready: {}", path.display());
        Ok(database)
    }

    /// Open a private in-memory database (tests and ephemeral runs).
    ///
    /// A single connection that never idles out, since every connection to
    /// `sqlite::memory:` gets its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let database = Self { pool };
        database.init_schema().await?;
        Ok(database)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes. Safe to call repeatedly.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_definitions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                category TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_instances (
                id TEXT PRIMARY KEY,
                definition_id TEXT NOT NULL,
                definition_name TEXT NOT NULL,
                document_id TEXT NOT NULL,
                status TEXT NOT NULL,
                current_stage TEXT NOT NULL,
                priority_rank INTEGER NOT NULL,
                started_at_ms INTEGER NOT NULL,
                completed_at_ms INTEGER,
                data JSON NOT NULL,
                version INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_tasks (
                instance_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                assignee TEXT NOT NULL,
                status TEXT NOT NULL,
                assigned_at_ms INTEGER NOT NULL,
                due_at_ms INTEGER,
                PRIMARY KEY (instance_id, task_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_instances_document ON workflow_instances(document_id)",
            "CREATE INDEX IF NOT EXISTS idx_instances_status ON workflow_instances(status)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_assignee_status ON workflow_tasks(assignee, status)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }

        Ok(())
    }
}
