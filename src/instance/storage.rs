//! SQLite persistence for workflow instances
//!
//! The aggregate is stored as one JSON document per row, with the columns
//! needed for lookups copied alongside. Pending tasks are mirrored into
//! `workflow_tasks` inside the same transaction so per-principal queries
//! can use an index. Every write after the insert is guarded by the row
//! version: a stale writer gets `Conflict` instead of overwriting.

use crate::error::{WorkflowError, WorkflowResult};
use crate::instance::types::{DocumentRef, InstanceStatus, Priority, WorkflowInstance};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqlitePool, SqliteRow},
    Row, Sqlite, Transaction,
};

#[derive(Debug, Clone)]
pub struct InstanceStorage {
    pool: SqlitePool,
}

/// Filters for a principal's task inbox
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQuery {
    pub definition_name: Option<String>,
    pub limit: Option<u32>,
}

/// One inbox row: a pending task plus the instance context it belongs to
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub instance_id: String,
    pub task_id: String,
    pub definition_name: String,
    pub document: DocumentRef,
    pub stage: String,
    pub assigned_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub started_by: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsQuery {
    pub definition_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatistics {
    pub total: i64,
    pub running: i64,
    pub completed: i64,
    pub cancelled: i64,
    pub paused: i64,
    /// Mean `completedAt - startedAt` over completed instances
    pub avg_duration_ms: Option<f64>,
}

impl InstanceStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a new instance at version 1
    pub async fn insert(&self, instance: &mut WorkflowInstance) -> WorkflowResult<()> {
        instance.version = 1;
        let data = serde_json::to_string(instance)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (id, definition_id, definition_name, document_id, status, current_stage,
                 priority_rank, started_at_ms, completed_at_ms, data, version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.definition_id)
        .bind(&instance.definition_name)
        .bind(&instance.document.document_id)
        .bind(instance.status.as_str())
        .bind(&instance.current_stage)
        .bind(instance.priority.rank())
        .bind(instance.started_at.timestamp_millis())
        .bind(instance.completed_at.map(|at| at.timestamp_millis()))
        .bind(&data)
        .bind(instance.version)
        .execute(&mut *tx)
        .await?;

        write_tasks(&mut tx, instance).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Conditional write: succeeds only if the stored row is still at
    /// `instance.version`, then bumps the version.
    pub async fn update(&self, instance: &mut WorkflowInstance) -> WorkflowResult<()> {
        let expected = instance.version;
        let next = expected + 1;
        // The version column is authoritative; the JSON copy is overwritten on read
        let data = serde_json::to_string(instance)?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = ?, current_stage = ?, priority_rank = ?, completed_at_ms = ?,
                data = ?, version = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(instance.status.as_str())
        .bind(&instance.current_stage)
        .bind(instance.priority.rank())
        .bind(instance.completed_at.map(|at| at.timestamp_millis()))
        .bind(&data)
        .bind(next)
        .bind(&instance.id)
        .bind(expected)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(WorkflowError::Conflict(instance.id.clone()));
        }

        write_tasks(&mut tx, instance).await?;
        tx.commit().await?;
        instance.version = next;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> WorkflowResult<Option<WorkflowInstance>> {
        let row = sqlx::query("SELECT data, version FROM workflow_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| decode(&row)).transpose()
    }

    /// Every instance ever started for a document, newest first
    pub async fn list_by_document(&self, document_id: &str) -> WorkflowResult<Vec<WorkflowInstance>> {
        let rows = sqlx::query(
            "SELECT data, version FROM workflow_instances WHERE document_id = ? ORDER BY started_at_ms DESC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode).collect()
    }

    pub async fn list_by_status(&self, status: InstanceStatus) -> WorkflowResult<Vec<WorkflowInstance>> {
        let rows = sqlx::query(
            "SELECT data, version FROM workflow_instances WHERE status = ? ORDER BY started_at_ms",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode).collect()
    }

    /// Pending tasks held by `principal` on running instances,
    /// most urgent first, then oldest instance first
    pub async fn pending_tasks_for(
        &self,
        principal: &str,
        query: &TaskQuery,
    ) -> WorkflowResult<Vec<TaskSummary>> {
        let limit = query.limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT t.task_id, i.data, i.version
            FROM workflow_tasks t
            JOIN workflow_instances i ON i.id = t.instance_id
            WHERE t.assignee = ? AND t.status = 'pending' AND i.status = 'running'
              AND (? IS NULL OR i.definition_name = ?)
            ORDER BY i.priority_rank DESC, i.started_at_ms ASC, t.assigned_at_ms ASC
            LIMIT ?
            "#,
        )
        .bind(principal)
        .bind(&query.definition_name)
        .bind(&query.definition_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let task_id: String = row.get("task_id");
            let instance = decode(row)?;
            let Some(task) = instance.pending_tasks.iter().find(|t| t.task_id == task_id) else {
                continue;
            };
            summaries.push(TaskSummary {
                instance_id: instance.id.clone(),
                task_id,
                definition_name: instance.definition_name.clone(),
                document: instance.document.clone(),
                stage: task.stage.clone(),
                assigned_at: task.assigned_at,
                due_date: task.due_date,
                priority: instance.priority,
                started_by: instance.started_by.clone(),
                started_at: instance.started_at,
            });
        }
        Ok(summaries)
    }

    pub async fn statistics(&self, query: &StatisticsQuery) -> WorkflowResult<WorkflowStatistics> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0) AS running,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END), 0) AS cancelled,
                COALESCE(SUM(CASE WHEN status = 'paused' THEN 1 ELSE 0 END), 0) AS paused,
                AVG(CASE WHEN status = 'completed' AND completed_at_ms IS NOT NULL
                         THEN CAST(completed_at_ms - started_at_ms AS REAL) END) AS avg_duration_ms
            FROM workflow_instances
            WHERE (? IS NULL OR definition_name = ?)
            "#,
        )
        .bind(&query.definition_name)
        .bind(&query.definition_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(WorkflowStatistics {
            total: row.get("total"),
            running: row.get("running"),
            completed: row.get("completed"),
            cancelled: row.get("cancelled"),
            paused: row.get("paused"),
            avg_duration_ms: row.get("avg_duration_ms"),
        })
    }
}

/// Replace the task child rows for one instance
async fn write_tasks(
    tx: &mut Transaction<'_, Sqlite>,
    instance: &WorkflowInstance,
) -> WorkflowResult<()> {
    sqlx::query("DELETE FROM workflow_tasks WHERE instance_id = ?")
        .bind(&instance.id)
        .execute(&mut **tx)
        .await?;

    for task in &instance.pending_tasks {
        sqlx::query(
            r#"
            INSERT INTO workflow_tasks
                (instance_id, task_id, stage, assignee, status, assigned_at_ms, due_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&instance.id)
        .bind(&task.task_id)
        .bind(&task.stage)
        .bind(&task.assignee)
        .bind(task.status.as_str())
        .bind(task.assigned_at.timestamp_millis())
        .bind(task.due_date.map(|at| at.timestamp_millis()))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn decode(row: &SqliteRow) -> WorkflowResult<WorkflowInstance> {
    let data: String = row.get("data");
    let mut instance: WorkflowInstance = serde_json::from_str(&data)?;
    instance.version = row.get("version");
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::types::HistoryEntry;
    use crate::store::Database;
    use chrono::Duration;
    use serde_json::Map;

    fn instance(id: &str, document_id: &str, priority: Priority, started_at: DateTime<Utc>) -> WorkflowInstance {
        let mut instance = WorkflowInstance {
            id: id.into(),
            definition_id: "def-1".into(),
            definition_name: "document_approval".into(),
            document: DocumentRef {
                document_id: document_id.into(),
                document_number: Some(format!("DOC-{id}")),
                document_type: None,
            },
            current_stage: String::new(),
            current_assignees: vec![],
            status: InstanceStatus::Running,
            history: vec![HistoryEntry::new("draft", "start", "alice", started_at)],
            pending_tasks: vec![],
            variables: Map::new(),
            priority,
            deadline: None,
            started_by: "alice".into(),
            started_at,
            completed_by: None,
            completed_at: None,
            completion_reason: None,
            version: 0,
        };
        instance.replace_pending_tasks("review", &["bob".into()], started_at, None);
        instance
    }

    async fn storage() -> InstanceStorage {
        let db = Database::in_memory().await.unwrap();
        InstanceStorage::new(db.pool().clone())
    }

    #[tokio::test]
    async fn insert_then_get_round_trips_with_version() {
        let storage = storage().await;
        let mut wi = instance("wi-1", "doc-1", Priority::Normal, Utc::now());
        storage.insert(&mut wi).await.unwrap();

        let loaded = storage.get("wi-1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.current_assignees, vec!["bob"]);
        assert!(storage.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_writer_gets_conflict() {
        let storage = storage().await;
        let mut wi = instance("wi-1", "doc-1", Priority::Normal, Utc::now());
        storage.insert(&mut wi).await.unwrap();

        let mut first = storage.get("wi-1").await.unwrap().unwrap();
        let mut second = storage.get("wi-1").await.unwrap().unwrap();

        first.replace_pending_tasks("approval", &["carol".into()], Utc::now(), None);
        storage.update(&mut first).await.unwrap();
        assert_eq!(first.version, 2);

        second.finish(InstanceStatus::Cancelled, "withdrawn", "alice", Utc::now());
        let err = storage.update(&mut second).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(id) if id == "wi-1"));
        assert_eq!(second.version, 1);

        let stored = storage.get("wi-1").await.unwrap().unwrap();
        assert_eq!(stored.current_stage, "approval");
        assert_eq!(stored.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn pending_tasks_sorted_by_priority_then_start() {
        let storage = storage().await;
        let base = Utc::now() - Duration::hours(5);

        let mut old_normal = instance("wi-old", "doc-1", Priority::Normal, base);
        let mut new_normal = instance("wi-new", "doc-2", Priority::Normal, base + Duration::hours(1));
        let mut urgent = instance("wi-urgent", "doc-3", Priority::Urgent, base + Duration::hours(2));
        let mut finished = instance("wi-done", "doc-4", Priority::Urgent, base);
        for wi in [&mut new_normal, &mut urgent, &mut old_normal, &mut finished] {
            storage.insert(wi).await.unwrap();
        }
        finished.finish(InstanceStatus::Completed, "completed", "bob", Utc::now());
        storage.update(&mut finished).await.unwrap();

        let tasks = storage
            .pending_tasks_for("bob", &TaskQuery::default())
            .await
            .unwrap();
        let order: Vec<&str> = tasks.iter().map(|t| t.instance_id.as_str()).collect();
        assert_eq!(order, vec!["wi-urgent", "wi-old", "wi-new"]);

        let limited = storage
            .pending_tasks_for("bob", &TaskQuery { definition_name: None, limit: Some(1) })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        let other = storage
            .pending_tasks_for("bob", &TaskQuery { definition_name: Some("invoice_approval".into()), limit: None })
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn statistics_count_statuses_and_average_duration() {
        let storage = storage().await;
        let start = Utc::now() - Duration::minutes(10);

        let mut a = instance("a", "doc-1", Priority::Normal, start);
        let mut b = instance("b", "doc-2", Priority::Normal, start);
        let mut c = instance("c", "doc-3", Priority::Normal, start);
        for wi in [&mut a, &mut b, &mut c] {
            storage.insert(wi).await.unwrap();
        }
        a.finish(InstanceStatus::Completed, "completed", "bob", start + Duration::seconds(4));
        storage.update(&mut a).await.unwrap();
        b.finish(InstanceStatus::Completed, "rejected", "bob", start + Duration::seconds(6));
        storage.update(&mut b).await.unwrap();

        let stats = storage.statistics(&StatisticsQuery::default()).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.cancelled, 0);
        assert_eq!(stats.avg_duration_ms, Some(5000.0));

        let empty = storage
            .statistics(&StatisticsQuery { definition_name: Some("nope".into()) })
            .await
            .unwrap();
        assert_eq!(empty.total, 0);
        assert_eq!(empty.avg_duration_ms, None);
    }

    #[tokio::test]
    async fn documents_list_every_instance_newest_first() {
        let storage = storage().await;
        let start = Utc::now() - Duration::hours(1);
        let mut first = instance("first", "doc-1", Priority::Normal, start);
        let mut second = instance("second", "doc-1", Priority::Normal, start + Duration::minutes(5));
        let mut other = instance("other", "doc-2", Priority::Normal, start);
        for wi in [&mut first, &mut second, &mut other] {
            storage.insert(wi).await.unwrap();
        }

        let listed = storage.list_by_document("doc-1").await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|wi| wi.id.as_str()).collect();
        assert_eq!(ids, vec!["second", "first"]);
        assert_eq!(storage.list_by_status(InstanceStatus::Running).await.unwrap().len(), 3);
    }
}
