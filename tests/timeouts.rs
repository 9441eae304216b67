mod common;

use chrono::{Duration, Utc};
use common::{act_as, assert_invariants, harness, memo_definition, start_as, vars};
use docflow::{
    instance::{InstanceStatus, TaskStatus, WorkflowInstance, SYSTEM_PRINCIPAL},
    runtime::{engine::StartOptions, notify::NotificationKind, sweeper::SweepReport},
    workflow::{
        types::{StageTimeout, TimeoutAction},
        validate::MAX_TIMEOUT_MS,
    },
    WorkflowError,
};
use serde_json::json;

async fn contract_at_manager_approval(h: &common::Harness, document_id: &str) -> WorkflowInstance {
    let instance = h
        .engine
        .start(
            "contract_approval",
            document_id,
            StartOptions {
                user_id: "alice".into(),
                manager_id: Some("mallory".into()),
                variables: vars(json!({ "counterparty": "Initech", "contractValue": 90000 })),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_invariants(&instance);
    let advanced = h
        .engine
        .perform_action(&instance.id, "approve", act_as("legal"))
        .await
        .unwrap();
    assert_invariants(&advanced);
    assert_eq!(advanced.current_stage, "manager_approval");
    advanced
}

#[tokio::test]
async fn nothing_happens_before_the_timeout() {
    let h = harness().await;
    h.engine
        .start("document_approval", "doc-1", start_as("alice"))
        .await
        .unwrap();

    let report = h
        .sweeper
        .process_timeouts_at(Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(report, SweepReport::default());
}

#[tokio::test]
async fn auto_reject_matches_an_explicit_rejection() {
    let h = harness().await;
    let timed_out = contract_at_manager_approval(&h, "contract-1").await;
    let explicit = contract_at_manager_approval(&h, "contract-2").await;

    let mut options = act_as("mallory");
    options.comment = Some("terms not acceptable".into());
    let explicit = h
        .engine
        .perform_action(&explicit.id, "reject", options)
        .await
        .unwrap();
    assert_invariants(&explicit);

    let report = h
        .sweeper
        .process_timeouts_at(Utc::now() + Duration::days(5) + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(report.auto_rejected, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);

    let rejected = h.engine.get_instance(&timed_out.id).await.unwrap();
    assert_invariants(&rejected);
    assert_eq!(rejected.status, explicit.status);
    assert_eq!(rejected.completion_reason, explicit.completion_reason);
    assert_eq!(rejected.current_stage, explicit.current_stage);
    assert_eq!(rejected.current_assignees, explicit.current_assignees);
    assert_eq!(rejected.completion_reason.as_deref(), Some("rejected"));
    assert_eq!(rejected.completed_by.as_deref(), Some(SYSTEM_PRINCIPAL));

    let last = rejected.history.last().unwrap();
    assert_eq!(last.action, "reject");
    assert_eq!(last.performed_by, SYSTEM_PRINCIPAL);
}

#[tokio::test]
async fn auto_approve_advances_as_the_system() {
    let h = harness().await;
    let mut definition = memo_definition("quick-memo");
    definition.stages[1].timeout = Some(StageTimeout {
        duration: 60_000,
        action: TimeoutAction::AutoApprove,
        escalate_to: vec![],
    });
    h.engine.definitions().create(definition).await.unwrap();
    let instance = h.engine.start("quick-memo", "doc-1", start_as("alice")).await.unwrap();
    assert_invariants(&instance);

    let report = h
        .sweeper
        .process_timeouts_at(Utc::now() + Duration::minutes(2))
        .await
        .unwrap();
    assert_eq!(report.auto_approved, 1);

    let advanced = h.engine.get_instance(&instance.id).await.unwrap();
    assert_invariants(&advanced);
    assert_eq!(advanced.current_stage, "signoff");
    assert_eq!(advanced.current_assignees, vec!["dave"]);
    let last = advanced.history.last().unwrap();
    assert_eq!((last.action.as_str(), last.performed_by.as_str()), ("approve", SYSTEM_PRINCIPAL));
}

#[tokio::test]
async fn oversized_timeouts_are_rejected_and_the_limit_still_works() {
    let h = harness().await;
    for duration in [u64::MAX, 10_000_000_000_000_000] {
        let mut definition = memo_definition("huge-memo");
        definition.stages[1].timeout = Some(StageTimeout {
            duration,
            action: TimeoutAction::AutoReject,
            escalate_to: vec![],
        });
        let err = h.engine.definitions().create(definition).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidDefinition(ref m) if m.contains("exceeds")), "{err:?}");
    }
    let err = h.engine.start("huge-memo", "doc-1", start_as("alice")).await.unwrap_err();
    assert!(matches!(err, WorkflowError::DefinitionNotFound(_)), "{err:?}");

    let mut definition = memo_definition("slow-memo");
    definition.stages[1].timeout = Some(StageTimeout {
        duration: MAX_TIMEOUT_MS,
        action: TimeoutAction::AutoReject,
        escalate_to: vec![],
    });
    h.engine.definitions().create(definition).await.unwrap();
    let instance = h.engine.start("slow-memo", "doc-1", start_as("alice")).await.unwrap();
    assert_invariants(&instance);
    let task = &instance.pending_tasks[0];
    let due = task.due_date.unwrap();
    assert!(due > task.assigned_at);
    assert_eq!((due - task.assigned_at).num_days(), 3650);

    let report = h
        .sweeper
        .process_timeouts_at(Utc::now() + Duration::days(365))
        .await
        .unwrap();
    assert_eq!(report, SweepReport::default());
    assert_eq!(h.stored(&instance.id).await.current_stage, "review");
}

#[tokio::test]
async fn escalation_reassigns_to_the_escalation_targets() {
    let h = harness().await;
    let instance = h
        .engine
        .start("document_approval", "doc-1", start_as("alice"))
        .await
        .unwrap();
    assert_invariants(&instance);

    let report = h
        .sweeper
        .process_timeouts_at(Utc::now() + Duration::hours(49))
        .await
        .unwrap();
    assert_eq!(report.escalated, 1);
    assert_eq!(report.processed, 1);

    let escalated = h.engine.get_instance(&instance.id).await.unwrap();
    assert_invariants(&escalated);
    assert_eq!(escalated.status, InstanceStatus::Running);
    assert_eq!(escalated.current_stage, "review");
    assert_eq!(escalated.current_assignees, vec!["review-supervisor"]);
    let original = escalated
        .pending_tasks
        .iter()
        .find(|task| task.assignee == "reviewer-role-members")
        .unwrap();
    assert_eq!(original.status, TaskStatus::Expired);
    let last = escalated.history.last().unwrap();
    assert_eq!(last.action, "timeout_escalate");
    assert_eq!(last.performed_by, SYSTEM_PRINCIPAL);

    let err = h
        .engine
        .perform_action(&instance.id, "approve", act_as("reviewer-role-members"))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::NotAssigned { .. }));

    let approved = h
        .engine
        .perform_action(&instance.id, "approve", act_as("review-supervisor"))
        .await
        .unwrap();
    assert_invariants(&approved);
    assert_eq!(approved.current_stage, "approval");

    let events = h.sink.settle().await;
    let timeout = events
        .iter()
        .find(|event| event.kind == NotificationKind::OnTimeout)
        .unwrap();
    assert_eq!(timeout.recipients, vec!["review-supervisor"]);
}

#[tokio::test]
async fn notify_fires_once_per_task() {
    let h = harness().await;
    let instance = h
        .engine
        .start("document_approval", "doc-1", start_as("alice"))
        .await
        .unwrap();
    assert_invariants(&instance);
    h.engine
        .perform_action(&instance.id, "approve", act_as("reviewer-role-members"))
        .await
        .unwrap();
    h.stored(&instance.id).await;

    let later = Utc::now() + Duration::hours(73);
    let first = h.sweeper.process_timeouts_at(later).await.unwrap();
    assert_eq!((first.notified, first.processed), (1, 1));

    let second = h.sweeper.process_timeouts_at(later).await.unwrap();
    assert_eq!(second, SweepReport::default());

    let stored = h.engine.get_instance(&instance.id).await.unwrap();
    assert_invariants(&stored);
    assert_eq!(stored.current_stage, "approval");
    let task = stored.pending_tasks.iter().find(|task| task.is_pending()).unwrap();
    assert!(task.timeout_notified);
    assert_eq!(task.assignee, "approver-role-members");
}

#[tokio::test]
async fn paused_instances_are_skipped() {
    let h = harness().await;
    let instance = h
        .engine
        .start("document_approval", "doc-1", start_as("alice"))
        .await
        .unwrap();
    assert_invariants(&instance);
    h.engine.pause_workflow(&instance.id, "alice").await.unwrap();
    h.stored(&instance.id).await;

    let report = h
        .sweeper
        .process_timeouts_at(Utc::now() + Duration::hours(49))
        .await
        .unwrap();
    assert_eq!(report.processed, 0);

    let stored = h.engine.get_instance(&instance.id).await.unwrap();
    assert_invariants(&stored);
    assert_eq!(stored.current_assignees, vec!["reviewer-role-members"]);
}

#[tokio::test]
async fn one_broken_instance_does_not_stop_the_sweep() {
    let h = harness().await;
    let healthy = h
        .engine
        .start("document_approval", "doc-1", start_as("alice"))
        .await
        .unwrap();
    assert_invariants(&healthy);

    let mut orphan = healthy.clone();
    orphan.id = "orphaned-instance".into();
    orphan.definition_id = "definition-that-was-removed".into();
    orphan.document.document_id = "doc-2".into();
    h.instances.insert(&mut orphan).await.unwrap();

    let report = h
        .sweeper
        .process_timeouts_at(Utc::now() + Duration::hours(49))
        .await
        .unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.escalated, 1);

    let escalated = h.engine.get_instance(&healthy.id).await.unwrap();
    assert_invariants(&escalated);
    assert_eq!(escalated.current_assignees, vec!["review-supervisor"]);
}
