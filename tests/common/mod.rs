#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use docflow::{
    instance::{storage::InstanceStorage, InstanceStatus, WorkflowInstance},
    runtime::{
        actions::ActionRegistry,
        assignee::AssigneeResolver,
        engine::{ActionOptions, StartOptions, WorkflowEngine},
        notify::{NotificationGateway, NotificationKind, NotificationSink, WorkflowEvent},
        sweeper::TimeoutSweeper,
    },
    store::Database,
    workflow::{registry::DefinitionStore, storage::DefinitionStorage, WorkflowDefinition},
};
use serde_json::{json, Map, Value};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<WorkflowEvent>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, event: &WorkflowEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

impl RecordingSink {
    /// Events delivered so far, after giving background delivery a moment
    pub async fn settle(&self) -> Vec<WorkflowEvent> {
        let mut last = usize::MAX;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let len = self.events.lock().unwrap().len();
            if len == last {
                break;
            }
            last = len;
        }
        self.events.lock().unwrap().clone()
    }

    pub async fn kinds_for(&self, instance_id: &str) -> Vec<(NotificationKind, String)> {
        self.settle()
            .await
            .into_iter()
            .filter(|event| event.instance_id == instance_id)
            .map(|event| (event.kind, event.stage))
            .collect()
    }
}

pub struct Harness {
    pub engine: Arc<WorkflowEngine>,
    pub sweeper: Arc<TimeoutSweeper>,
    pub instances: InstanceStorage,
    pub sink: Arc<RecordingSink>,
}

pub async fn harness() -> Harness {
    harness_with(|_| ActionRegistry::with_defaults()).await
}

/// Engine over a fresh in-memory database with the bundled templates seeded
pub async fn harness_with(actions: impl FnOnce(&InstanceStorage) -> ActionRegistry) -> Harness {
    let database = Database::in_memory().await.unwrap();
    let definitions = Arc::new(DefinitionStore::new(DefinitionStorage::new(
        database.pool().clone(),
    )));
    definitions.init_from_storage().await.unwrap();
    definitions.seed_defaults().await.unwrap();

    let instances = InstanceStorage::new(database.pool().clone());
    let sink = Arc::new(RecordingSink::default());
    let engine = Arc::new(WorkflowEngine::new(
        definitions,
        instances.clone(),
        AssigneeResolver::default(),
        actions(&instances),
        NotificationGateway::new(sink.clone()),
    ));
    let sweeper = Arc::new(TimeoutSweeper::new(Arc::clone(&engine)));

    Harness {
        engine,
        sweeper,
        instances,
        sink,
    }
}

impl Harness {
    /// Reload an instance and check it is still well formed
    pub async fn stored(&self, instance_id: &str) -> WorkflowInstance {
        let instance = self.engine.get_instance(instance_id).await.unwrap();
        assert_invariants(&instance);
        instance
    }
}

/// Structural invariants every reachable instance state must hold
pub fn assert_invariants(instance: &WorkflowInstance) {
    let mut pending: Vec<&str> = instance
        .pending_tasks
        .iter()
        .filter(|task| task.is_pending())
        .map(|task| task.assignee.as_str())
        .collect();
    pending.sort_unstable();
    pending.dedup();
    let mut current: Vec<&str> = instance.current_assignees.iter().map(String::as_str).collect();
    current.sort_unstable();
    let distinct = current.len();
    current.dedup();
    assert_eq!(distinct, current.len(), "duplicate assignees in {:?}", instance.current_assignees);
    assert_eq!(pending, current, "current assignees drifted from pending tasks");

    for task in instance.pending_tasks.iter().filter(|task| task.is_pending()) {
        assert_eq!(
            task.stage, instance.current_stage,
            "pending task {} belongs to another stage",
            task.task_id
        );
    }

    assert!(!instance.history.is_empty());
    assert_eq!(instance.history[0].action, "start");
    match instance.status {
        InstanceStatus::Completed | InstanceStatus::Cancelled => {
            assert!(instance.current_assignees.is_empty());
            assert!(instance.completed_at.is_some());
            assert!(instance.completion_reason.is_some());
        }
        InstanceStatus::Running | InstanceStatus::Paused => {
            assert!(instance.completed_at.is_none());
        }
    }
}

pub fn start_as(user_id: &str) -> StartOptions {
    StartOptions {
        user_id: user_id.to_string(),
        ..Default::default()
    }
}

pub fn act_as(user_id: &str) -> ActionOptions {
    ActionOptions {
        user_id: user_id.to_string(),
        ..Default::default()
    }
}

pub fn vars(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// draft -> review (bob, carol) -> signoff (dave) -> done
pub fn memo_definition(name: &str) -> WorkflowDefinition {
    serde_json::from_value(json!({
        "name": name,
        "category": "approval",
        "stages": [
            {
                "name": "draft", "order": 0, "type": "start",
                "actions": [{ "name": "submit", "type": "approve", "nextStage": "review" }]
            },
            {
                "name": "review", "order": 1, "type": "review",
                "assignees": { "type": "user", "value": ["bob", "carol"] },
                "actions": [
                    { "name": "approve", "type": "approve", "nextStage": "signoff" },
                    { "name": "reject", "type": "reject", "nextStage": "draft" },
                    { "name": "comment", "type": "comment" },
                    { "name": "delegate", "type": "delegate" }
                ]
            },
            {
                "name": "signoff", "order": 2, "type": "approval",
                "assignees": { "type": "user", "value": ["dave"] },
                "actions": [
                    { "name": "approve", "type": "approve", "nextStage": "done" },
                    { "name": "reject", "type": "reject" }
                ]
            },
            { "name": "done", "order": 3, "type": "end" }
        ],
        "transitions": [{ "from": "draft", "to": "review" }]
    }))
    .unwrap()
}
