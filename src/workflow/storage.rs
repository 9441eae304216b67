//! SQLite persistence for workflow definitions
//!
//! Definitions are stored as JSON with the indexed lookup fields (name,
//! category, active flag) duplicated into columns.

use crate::error::WorkflowResult;
use crate::workflow::types::WorkflowDefinition;
use sqlx::{sqlite::SqlitePool, Row};

#[derive(Debug, Clone)]
pub struct DefinitionStorage {
    pool: SqlitePool,
}

/// Listing row for definition overviews
#[derive(Debug, Clone, serde::Serialize)]
pub struct DefinitionMetadata {
    pub id: String,
    pub name: String,
    pub category: String,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl DefinitionStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a definition by id.
    ///
    /// The unique index on `name` rejects a second definition with the same
    /// name; callers check uniqueness first to report it cleanly.
    pub async fn save(&self, definition: &WorkflowDefinition) -> WorkflowResult<()> {
        let definition_json = serde_json::to_string(definition)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (id, name, category, is_active, definition, updated_at)
            VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                category = excluded.category,
                is_active = excluded.is_active,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&definition.id)
        .bind(&definition.name)
        .bind(&definition.category)
        .bind(definition.is_active)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> WorkflowResult<Option<WorkflowDefinition>> {
        let row = sqlx::query("SELECT definition FROM workflow_definitions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| decode(&row)).transpose()
    }

    pub async fn get_by_name(&self, name: &str) -> WorkflowResult<Option<WorkflowDefinition>> {
        let row = sqlx::query("SELECT definition FROM workflow_definitions WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| decode(&row)).transpose()
    }

    pub async fn list(&self) -> WorkflowResult<Vec<DefinitionMetadata>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, category, is_active,
                   CAST(created_at AS TEXT) AS created_at,
                   CAST(updated_at AS TEXT) AS updated_at
            FROM workflow_definitions
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DefinitionMetadata {
                id: row.get("id"),
                name: row.get("name"),
                category: row.get("category"),
                is_active: row.get("is_active"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    /// Every stored definition, active or not, for registry warm-up
    pub async fn load_all(&self) -> WorkflowResult<Vec<WorkflowDefinition>> {
        let rows = sqlx::query("SELECT definition FROM workflow_definitions")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(decode).collect()
    }
}

fn decode(row: &sqlx::sqlite::SqliteRow) -> WorkflowResult<WorkflowDefinition> {
    let definition_json: String = row.get("definition");
    Ok(serde_json::from_str(&definition_json)?)
}
