//! Workflow instance aggregate
//!
//! One instance per document under workflow. History and pending tasks are
//! owned collections inside the aggregate; `current_assignees` is derived
//! from the pending tasks and only ever recomputed by the mutators below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Principal recorded for engine-initiated actions (timeouts, escalation)
pub const SYSTEM_PRINCIPAL: &str = "system";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: String,
    /// Definition the instance started with; kept even if the template changes
    pub definition_id: String,
    pub definition_name: String,
    pub document: DocumentRef,
    pub current_stage: String,
    pub current_assignees: Vec<String>,
    pub status: InstanceStatus,
    pub history: Vec<HistoryEntry>,
    pub pending_tasks: Vec<PendingTask>,
    pub variables: Map<String, Value>,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub started_by: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<String>,
    /// Optimistic concurrency token, owned by the instance store
    #[serde(default)]
    pub version: i64,
}

/// Cached view of the external document; the engine never writes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRef {
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
    Cancelled,
    Paused,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Sort key persisted alongside the instance row
    pub fn rank(&self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Urgent => 3,
        }
    }
}

/// Append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub stage: String,
    pub action: String,
    pub performed_by: String,
    pub performed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl HistoryEntry {
    pub fn new(stage: &str, action: &str, performed_by: &str, at: DateTime<Utc>) -> Self {
        Self {
            stage: stage.to_string(),
            action: action.to_string(),
            performed_by: performed_by.to_string(),
            performed_at: at,
            comment: None,
            attachments: Vec::new(),
            metadata: Value::Null,
        }
    }

    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One principal's unit of work at one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTask {
    pub task_id: String,
    pub stage: String,
    pub assignee: String,
    pub assigned_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set once a `notify` timeout has fired for this task
    #[serde(default)]
    pub timeout_notified: bool,
}

impl PendingTask {
    pub fn new(
        stage: &str,
        assignee: &str,
        assigned_at: DateTime<Utc>,
        due_date: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            stage: stage.to_string(),
            assignee: assignee.to_string(),
            assigned_at,
            due_date,
            status: TaskStatus::Pending,
            completed_at: None,
            timeout_notified: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Expired,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }
}

impl WorkflowInstance {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    /// Running with nobody left to act: assignee resolution came back empty
    pub fn is_stalled(&self) -> bool {
        self.is_running() && self.current_assignees.is_empty()
    }

    /// The caller's live task in the current stage
    pub fn pending_task_for(&self, assignee: &str) -> Option<&PendingTask> {
        self.pending_tasks.iter().find(|task| {
            task.is_pending() && task.assignee == assignee && task.stage == self.current_stage
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending_tasks.iter().filter(|task| task.is_pending()).count()
    }

    /// Enter `stage`, dropping every task of the previous stage.
    ///
    /// This is the only way the active stage changes while running, so the
    /// single-active-stage invariant is maintained here.
    pub fn replace_pending_tasks(
        &mut self,
        stage: &str,
        assignees: &[String],
        at: DateTime<Utc>,
        due_date: Option<DateTime<Utc>>,
    ) {
        self.current_stage = stage.to_string();
        self.pending_tasks = assignees
            .iter()
            .map(|assignee| PendingTask::new(stage, assignee, at, due_date))
            .collect();
        self.sync_assignees();
    }

    /// Mark a task completed by id; returns false if it was not pending
    pub fn complete_task(&mut self, task_id: &str, at: DateTime<Utc>) -> bool {
        let completed = match self
            .pending_tasks
            .iter_mut()
            .find(|task| task.task_id == task_id && task.is_pending())
        {
            Some(task) => {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(at);
                true
            }
            None => false,
        };
        self.sync_assignees();
        completed
    }

    /// Mark a task expired by id; returns false if it was not pending
    pub fn expire_task(&mut self, task_id: &str, at: DateTime<Utc>) -> bool {
        let expired = match self
            .pending_tasks
            .iter_mut()
            .find(|task| task.task_id == task_id && task.is_pending())
        {
            Some(task) => {
                task.status = TaskStatus::Expired;
                task.completed_at = Some(at);
                true
            }
            None => false,
        };
        self.sync_assignees();
        expired
    }

    /// Add a pending task in the current stage unless the principal already holds one
    pub fn add_pending_task(
        &mut self,
        assignee: &str,
        at: DateTime<Utc>,
        due_date: Option<DateTime<Utc>>,
    ) -> bool {
        if self.pending_task_for(assignee).is_some() {
            return false;
        }
        let stage = self.current_stage.clone();
        self.pending_tasks
            .push(PendingTask::new(&stage, assignee, at, due_date));
        self.sync_assignees();
        true
    }

    /// Move to a terminal status; pending tasks are closed out
    pub fn finish(
        &mut self,
        status: InstanceStatus,
        reason: &str,
        by: &str,
        at: DateTime<Utc>,
    ) {
        self.status = status;
        self.completion_reason = Some(reason.to_string());
        self.completed_by = Some(by.to_string());
        self.completed_at = Some(at);
        self.pending_tasks.retain(|task| !task.is_pending());
        self.sync_assignees();
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    /// Recompute `current_assignees` as the distinct pending assignees
    fn sync_assignees(&mut self) {
        let mut assignees: Vec<String> = Vec::new();
        for task in self.pending_tasks.iter().filter(|task| task.is_pending()) {
            if !assignees.contains(&task.assignee) {
                assignees.push(task.assignee.clone());
            }
        }
        self.current_assignees = assignees;
    }
}
