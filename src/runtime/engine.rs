//! Workflow engine: the instance state machine
//!
//! Every mutation follows the same path: load the instance, compute the
//! new state against its definition, then write it back guarded by the row
//! version. A `Conflict` on write means another writer (a second assignee
//! or the timeout sweeper) got there first; the engine reloads and
//! recomputes, so the loser sees the winner's result (`NotAssigned` or
//! `InvalidState`) rather than overwriting it.

use crate::error::{WorkflowError, WorkflowResult};
use crate::instance::storage::{
    InstanceStorage, StatisticsQuery, TaskQuery, TaskSummary, WorkflowStatistics,
};
use crate::instance::types::{
    DocumentRef, HistoryEntry, InstanceStatus, Priority, WorkflowInstance, SYSTEM_PRINCIPAL,
};
use crate::runtime::actions::{ActionContext, ActionRegistry};
use crate::runtime::assignee::{AssigneeResolver, ResolutionContext};
use crate::runtime::condition;
use crate::runtime::notify::{NotificationGateway, NotificationKind, WorkflowEvent};
use crate::workflow::registry::DefinitionStore;
use crate::workflow::types::{
    ActionType, Stage, StageAction, StageType, TimeoutAction, WorkflowDefinition,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Variable key holding the principal used for `manager` assignment
pub const MANAGER_VARIABLE: &str = "managerId";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    pub user_id: String,
    pub document_number: Option<String>,
    pub document_type: Option<String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub priority: Priority,
    pub deadline: Option<DateTime<Utc>>,
    pub manager_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOptions {
    pub user_id: String,
    pub comment: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Merged into the instance variables before conditions are checked
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Target principal when the action is `delegate`
    pub delegate_to: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateOptions {
    pub user_id: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOptions {
    pub user_id: String,
    pub reason: Option<String>,
}

/// Who is acting on a pending task
#[derive(Debug, Clone, Copy)]
enum Actor<'a> {
    /// A principal acting on their own pending task
    Assignee(&'a str),
    /// The engine acting on a specific task after a timeout
    System { task_id: &'a str },
}

/// Where an action sends the instance
#[derive(Debug, Clone, PartialEq)]
enum Route {
    Stay,
    Finish(&'static str),
    Enter(String),
}

/// What the sweeper did to one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    Untouched,
    Escalated(usize),
    Notified(usize),
    AutoApproved,
    AutoRejected,
}

pub struct WorkflowEngine {
    definitions: Arc<DefinitionStore>,
    instances: InstanceStorage,
    resolver: AssigneeResolver,
    actions: ActionRegistry,
    notifier: NotificationGateway,
    max_conflict_retries: u32,
}

impl WorkflowEngine {
    pub fn new(
        definitions: Arc<DefinitionStore>,
        instances: InstanceStorage,
        resolver: AssigneeResolver,
        actions: ActionRegistry,
        notifier: NotificationGateway,
    ) -> Self {
        Self {
            definitions,
            instances,
            resolver,
            actions,
            notifier,
            max_conflict_retries: 3,
        }
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn definitions(&self) -> &Arc<DefinitionStore> {
        &self.definitions
    }

    /// Start a definition against a document and enter its first working stage
    pub async fn start(
        &self,
        definition_name: &str,
        document_id: &str,
        options: StartOptions,
    ) -> WorkflowResult<WorkflowInstance> {
        let definition = self.definitions.find_active_by_name(definition_name)?;
        let start = definition
            .start_stage()
            .ok_or_else(|| WorkflowError::NoStartStage(definition.name.clone()))?;

        let mut variables = options.variables;
        if let Some(manager) = &options.manager_id {
            variables.insert(MANAGER_VARIABLE.to_string(), json!(manager));
        }

        let variables_value = Value::Object(variables.clone());
        let target = definition
            .transitions_from(&start.name)
            .find(|transition| {
                transition
                    .condition
                    .as_ref()
                    .map_or(true, |c| condition::evaluate(c, &variables_value))
            })
            .and_then(|transition| definition.stage(&transition.to))
            .or_else(|| definition.stage_after(&start.name))
            .ok_or_else(|| {
                WorkflowError::InvalidDefinition(format!(
                    "'{}' has no stage to enter after '{}'",
                    definition.name, start.name
                ))
            })?;

        let now = Utc::now();
        let mut instance = WorkflowInstance {
            id: uuid::Uuid::new_v4().to_string(),
            definition_id: definition.id.clone(),
            definition_name: definition.name.clone(),
            document: DocumentRef {
                document_id: document_id.to_string(),
                document_number: options.document_number,
                document_type: options.document_type,
            },
            current_stage: start.name.clone(),
            current_assignees: Vec::new(),
            status: InstanceStatus::Running,
            history: vec![HistoryEntry::new(&start.name, "start", &options.user_id, now)
                .with_metadata(json!({ "targetStage": target.name }))],
            pending_tasks: Vec::new(),
            variables,
            priority: options.priority,
            deadline: options.deadline,
            started_by: options.user_id.clone(),
            started_at: now,
            completed_by: None,
            completed_at: None,
            completion_reason: None,
            version: 0,
        };

        let events = self
            .enter_stage(&mut instance, &definition, target, &options.user_id, now)
            .await;
        self.instances.insert(&mut instance).await?;

        tracing::info!(
            "🚀 Started workflow {} ({}) for document {} at stage '{}'",
            instance.id,
            definition.name,
            document_id,
            instance.current_stage
        );
        self.notifier.emit_all(events);
        Ok(instance)
    }

    /// Perform a stage action as one of the stage's current assignees
    pub async fn perform_action(
        &self,
        instance_id: &str,
        action: &str,
        options: ActionOptions,
    ) -> WorkflowResult<WorkflowInstance> {
        if action == ActionType::Delegate.as_str() {
            // Delegation through the action surface needs the stage to declare it
            let instance = self.load(instance_id).await?;
            let definition = self.definitions.get(&instance.definition_id)?;
            ensure_status(&instance, InstanceStatus::Running)?;
            if instance.pending_task_for(&options.user_id).is_none() {
                return Err(not_assigned(&instance, &options.user_id));
            }
            let stage = current_stage(&instance, &definition)?;
            if !stage
                .actions
                .iter()
                .any(|declared| declared.action_type == ActionType::Delegate)
            {
                return Err(WorkflowError::ActionNotAllowed {
                    stage: stage.name.clone(),
                    action: action.to_string(),
                });
            }

            let to = options
                .delegate_to
                .clone()
                .ok_or_else(|| WorkflowError::MissingFields(vec!["delegateTo".to_string()]))?;
            return self
                .delegate_task(
                    instance_id,
                    &to,
                    DelegateOptions {
                        user_id: options.user_id,
                        comment: options.comment,
                    },
                )
                .await;
        }

        self.act(instance_id, action, Actor::Assignee(&options.user_id), &options)
            .await
    }

    /// Hand the caller's pending task to another principal in the same stage
    pub async fn delegate_task(
        &self,
        instance_id: &str,
        to_user_id: &str,
        options: DelegateOptions,
    ) -> WorkflowResult<WorkflowInstance> {
        let mut handler_output: Option<Option<Value>> = None;
        let mut attempt = 0;

        loop {
            let mut instance = self.load(instance_id).await?;
            let definition = self.definitions.get(&instance.definition_id)?;
            ensure_status(&instance, InstanceStatus::Running)?;

            let task = instance
                .pending_task_for(&options.user_id)
                .cloned()
                .ok_or_else(|| not_assigned(&instance, &options.user_id))?;
            let stage = current_stage(&instance, &definition)?;
            if !definition.settings.allow_delegate {
                return Err(WorkflowError::ActionNotAllowed {
                    stage: stage.name.clone(),
                    action: "delegate".to_string(),
                });
            }

            if handler_output.is_none() {
                let declared = stage
                    .actions
                    .iter()
                    .find(|a| a.action_type == ActionType::Delegate)
                    .cloned()
                    .unwrap_or_else(|| StageAction {
                        name: "delegate".to_string(),
                        action_type: ActionType::Delegate,
                        next_stage: None,
                        conditions: Vec::new(),
                    });
                let ctx = ActionContext {
                    instance: &instance,
                    stage,
                    action: &declared,
                    performed_by: &options.user_id,
                    comment: options.comment.as_deref(),
                };
                handler_output = Some(self.invoke_handler("delegate", &ctx).await?);
            }

            let now = Utc::now();
            instance.complete_task(&task.task_id, now);
            instance.add_pending_task(to_user_id, now, task.due_date);
            instance.record(
                HistoryEntry::new(&stage.name, "delegate", &options.user_id, now)
                    .with_comment(options.comment.clone())
                    .with_metadata(json!({
                        "delegatedTo": to_user_id,
                        "handler": handler_output.clone().flatten(),
                    })),
            );

            let mut events = Vec::new();
            if stage.notifications.on_enter {
                events.push(event(
                    NotificationKind::OnEnter,
                    &instance,
                    &stage.name,
                    vec![to_user_id.to_string()],
                    now,
                    json!({ "delegatedBy": options.user_id }),
                ));
            }

            match self.instances.update(&mut instance).await {
                Ok(()) => {
                    tracing::info!(
                        "🔀 {} delegated stage '{}' of {} to {}",
                        options.user_id,
                        stage.name,
                        instance.id,
                        to_user_id
                    );
                    self.notifier.emit_all(events);
                    return Ok(instance);
                }
                Err(WorkflowError::Conflict(_)) if attempt < self.max_conflict_retries => {
                    attempt += 1;
                    tracing::debug!("Retrying delegate on {} after conflict ({})", instance_id, attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Cancel a running instance; cancelling twice is an `InvalidState` error
    pub async fn cancel_workflow(
        &self,
        instance_id: &str,
        options: CancelOptions,
    ) -> WorkflowResult<WorkflowInstance> {
        let reason = options
            .reason
            .clone()
            .unwrap_or_else(|| "cancelled".to_string());

        let instance = self
            .commit(instance_id, Utc::now(), |instance, definition, now| {
                ensure_status(instance, InstanceStatus::Running)?;
                if !definition.settings.allow_cancel {
                    return Err(WorkflowError::ActionNotAllowed {
                        stage: instance.current_stage.clone(),
                        action: "cancel".to_string(),
                    });
                }

                let stage = instance.current_stage.clone();
                instance.record(
                    HistoryEntry::new(&stage, "cancel", &options.user_id, now)
                        .with_comment(options.reason.clone()),
                );
                instance.finish(InstanceStatus::Cancelled, &reason, &options.user_id, now);

                Ok(Some(vec![event(
                    NotificationKind::OnComplete,
                    instance,
                    &stage,
                    vec![instance.started_by.clone()],
                    now,
                    json!({ "status": "cancelled", "reason": reason }),
                )]))
            })
            .await?;

        tracing::info!("🛑 Cancelled workflow {} ({})", instance.id, reason);
        Ok(instance)
    }

    /// Suspend a running instance; the sweeper leaves paused instances alone
    pub async fn pause_workflow(&self, instance_id: &str, user_id: &str) -> WorkflowResult<WorkflowInstance> {
        self.commit(instance_id, Utc::now(), |instance, _definition, now| {
            ensure_status(instance, InstanceStatus::Running)?;
            instance.status = InstanceStatus::Paused;
            let stage = instance.current_stage.clone();
            instance.record(HistoryEntry::new(&stage, "pause", user_id, now));
            Ok(Some(Vec::new()))
        })
        .await
    }

    pub async fn resume_workflow(&self, instance_id: &str, user_id: &str) -> WorkflowResult<WorkflowInstance> {
        self.commit(instance_id, Utc::now(), |instance, _definition, now| {
            ensure_status(instance, InstanceStatus::Paused)?;
            instance.status = InstanceStatus::Running;
            let stage = instance.current_stage.clone();
            instance.record(HistoryEntry::new(&stage, "resume", user_id, now));
            Ok(Some(Vec::new()))
        })
        .await
    }

    pub async fn get_instance(&self, instance_id: &str) -> WorkflowResult<WorkflowInstance> {
        self.load(instance_id).await
    }

    pub async fn get_document_workflows(&self, document_id: &str) -> WorkflowResult<Vec<WorkflowInstance>> {
        self.instances.list_by_document(document_id).await
    }

    pub async fn get_pending_tasks(
        &self,
        principal: &str,
        query: &TaskQuery,
    ) -> WorkflowResult<Vec<TaskSummary>> {
        self.instances.pending_tasks_for(principal, query).await
    }

    pub async fn get_statistics(&self, query: &StatisticsQuery) -> WorkflowResult<WorkflowStatistics> {
        self.instances.statistics(query).await
    }

    pub(crate) async fn running_instance_ids(&self) -> WorkflowResult<Vec<String>> {
        Ok(self
            .instances
            .list_by_status(InstanceStatus::Running)
            .await?
            .into_iter()
            .map(|instance| instance.id)
            .collect())
    }

    /// Apply the current stage's timeout policy to tasks pending longer than
    /// its duration as of `now`
    pub(crate) async fn handle_timeouts(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> WorkflowResult<TimeoutOutcome> {
        let instance = self.load(instance_id).await?;
        if !instance.is_running() {
            return Ok(TimeoutOutcome::Untouched);
        }
        let definition = self.definitions.get(&instance.definition_id)?;
        let stage = current_stage(&instance, &definition)?;
        let Some(timeout) = stage.timeout.clone() else {
            return Ok(TimeoutOutcome::Untouched);
        };

        let expired = expired_task_ids(&instance, stage, now);
        if expired.is_empty() {
            return Ok(TimeoutOutcome::Untouched);
        }

        match timeout.action {
            TimeoutAction::AutoApprove | TimeoutAction::AutoReject => {
                let (action, outcome, verb) = if timeout.action == TimeoutAction::AutoApprove {
                    ("approve", TimeoutOutcome::AutoApproved, "approved")
                } else {
                    ("reject", TimeoutOutcome::AutoRejected, "rejected")
                };
                let options = ActionOptions {
                    user_id: SYSTEM_PRINCIPAL.to_string(),
                    comment: Some(format!("Automatically {verb} after stage timeout")),
                    ..Default::default()
                };
                self.act(instance_id, action, Actor::System { task_id: &expired[0] }, &options)
                    .await?;
                Ok(outcome)
            }
            TimeoutAction::Escalate => {
                let mut escalated = 0;
                self.commit(instance_id, now, |instance, definition, now| {
                    let stage = current_stage(instance, definition)?;
                    let expired = expired_task_ids(instance, stage, now);
                    escalated = expired.len();
                    if expired.is_empty() {
                        return Ok(None);
                    }

                    let mut from = Vec::new();
                    for task_id in &expired {
                        if let Some(task) = instance.pending_tasks.iter().find(|t| &t.task_id == task_id) {
                            from.push(task.assignee.clone());
                        }
                        instance.expire_task(task_id, now);
                    }
                    let due = due_date(stage, instance.deadline, now);
                    for principal in &timeout.escalate_to {
                        instance.add_pending_task(principal, now, due);
                    }
                    let stage_name = stage.name.clone();
                    instance.record(
                        HistoryEntry::new(&stage_name, "timeout_escalate", SYSTEM_PRINCIPAL, now)
                            .with_metadata(json!({ "from": from, "to": timeout.escalate_to })),
                    );

                    let mut events = Vec::new();
                    if stage.notifications.on_timeout {
                        events.push(event(
                            NotificationKind::OnTimeout,
                            instance,
                            &stage_name,
                            timeout.escalate_to.clone(),
                            now,
                            json!({ "escalatedFrom": from }),
                        ));
                    }
                    Ok(Some(events))
                })
                .await?;
                Ok(TimeoutOutcome::Escalated(escalated))
            }
            TimeoutAction::Notify => {
                let mut notified = 0;
                self.commit(instance_id, now, |instance, definition, now| {
                    let stage = current_stage(instance, definition)?;
                    let fresh: Vec<String> = expired_task_ids(instance, stage, now)
                        .into_iter()
                        .filter(|id| {
                            instance
                                .pending_tasks
                                .iter()
                                .any(|t| &t.task_id == id && !t.timeout_notified)
                        })
                        .collect();
                    notified = fresh.len();
                    if fresh.is_empty() {
                        return Ok(None);
                    }

                    let mut recipients = Vec::new();
                    for task in instance.pending_tasks.iter_mut() {
                        if fresh.contains(&task.task_id) {
                            task.timeout_notified = true;
                            recipients.push(task.assignee.clone());
                        }
                    }
                    recipients.extend(timeout.escalate_to.iter().cloned());

                    let events = if stage.notifications.on_timeout {
                        vec![event(
                            NotificationKind::OnTimeout,
                            instance,
                            &stage.name,
                            recipients,
                            now,
                            Value::Null,
                        )]
                    } else {
                        Vec::new()
                    };
                    Ok(Some(events))
                })
                .await?;
                Ok(TimeoutOutcome::Notified(notified))
            }
        }
    }

    /// Shared load / apply / guarded-write loop for actions on a pending task
    async fn act(
        &self,
        instance_id: &str,
        requested: &str,
        actor: Actor<'_>,
        options: &ActionOptions,
    ) -> WorkflowResult<WorkflowInstance> {
        // The handler's side effect runs once even if the write is retried
        let mut handler_output: Option<Option<Value>> = None;
        let mut attempt = 0;

        loop {
            let mut instance = self.load(instance_id).await?;
            let definition = self.definitions.get(&instance.definition_id)?;
            let events = self
                .apply_action(&mut instance, &definition, requested, actor, options, &mut handler_output)
                .await?;

            match self.instances.update(&mut instance).await {
                Ok(()) => {
                    self.notifier.emit_all(events);
                    return Ok(instance);
                }
                Err(WorkflowError::Conflict(_)) if attempt < self.max_conflict_retries => {
                    attempt += 1;
                    tracing::debug!(
                        "Retrying '{}' on {} after conflict ({})",
                        requested,
                        instance_id,
                        attempt
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn apply_action(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        requested: &str,
        actor: Actor<'_>,
        options: &ActionOptions,
        handler_output: &mut Option<Option<Value>>,
    ) -> WorkflowResult<Vec<WorkflowEvent>> {
        ensure_status(instance, InstanceStatus::Running)?;

        let (task_id, performed_by) = match actor {
            Actor::Assignee(user_id) => {
                let task = instance
                    .pending_task_for(user_id)
                    .ok_or_else(|| not_assigned(instance, user_id))?;
                (task.task_id.clone(), user_id.to_string())
            }
            Actor::System { task_id } => {
                let live = instance.pending_tasks.iter().any(|task| {
                    task.task_id == task_id && task.is_pending() && task.stage == instance.current_stage
                });
                if !live {
                    return Err(not_assigned(instance, SYSTEM_PRINCIPAL));
                }
                (task_id.to_string(), SYSTEM_PRINCIPAL.to_string())
            }
        };
        let is_system = matches!(actor, Actor::System { .. });

        let stage = current_stage(instance, definition)?;
        instance
            .variables
            .extend(options.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        let variables = Value::Object(instance.variables.clone());

        let not_allowed = || WorkflowError::ActionNotAllowed {
            stage: stage.name.clone(),
            action: requested.to_string(),
        };
        let candidates: Vec<&StageAction> =
            stage.actions.iter().filter(|a| a.matches(requested)).collect();
        if candidates.is_empty() {
            return Err(not_allowed());
        }
        let action = candidates
            .into_iter()
            .find(|a| condition::all_hold(&a.conditions, &variables))
            .ok_or_else(not_allowed)?;

        if !is_system {
            let comment_missing = options
                .comment
                .as_deref()
                .map_or(true, |c| c.trim().is_empty());
            if action.action_type == ActionType::Reject
                && definition.settings.require_comment_on_reject
                && comment_missing
            {
                return Err(WorkflowError::CommentRequired(stage.name.clone()));
            }
            if action.action_type == ActionType::Approve {
                let missing: Vec<String> = stage
                    .required_fields
                    .iter()
                    .filter(|field| instance.variables.get(*field).map_or(true, Value::is_null))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    return Err(WorkflowError::MissingFields(missing));
                }
            }
        }

        let route = self.route(instance, definition, stage, action, &task_id, &variables)?;

        if handler_output.is_none() {
            let ctx = ActionContext {
                instance,
                stage,
                action,
                performed_by: &performed_by,
                comment: options.comment.as_deref(),
            };
            *handler_output = Some(self.invoke_handler(requested, &ctx).await?);
        }

        let now = Utc::now();
        let previous_assignees = instance.current_assignees.clone();
        instance.record(
            HistoryEntry::new(&stage.name, requested, &performed_by, now)
                .with_comment(options.comment.clone())
                .with_attachments(options.attachments.clone())
                .with_metadata(handler_output.clone().flatten().unwrap_or(Value::Null)),
        );

        if action.action_type.is_informational() && route == Route::Stay {
            return Ok(Vec::new());
        }
        instance.complete_task(&task_id, now);

        let mut events = Vec::new();
        match route {
            Route::Stay => {
                tracing::debug!(
                    "'{}' on {} leaves stage '{}' with {} pending",
                    requested,
                    instance.id,
                    stage.name,
                    instance.pending_count()
                );
            }
            Route::Finish(reason) => {
                if stage.notifications.on_exit {
                    events.push(event(NotificationKind::OnExit, instance, &stage.name, previous_assignees, now, Value::Null));
                }
                instance.finish(InstanceStatus::Completed, reason, &performed_by, now);
                events.push(event(
                    NotificationKind::OnComplete,
                    instance,
                    &stage.name,
                    vec![instance.started_by.clone()],
                    now,
                    json!({ "status": "completed", "reason": reason }),
                ));
                tracing::info!("🏁 Workflow {} finished at '{}' ({})", instance.id, stage.name, reason);
            }
            Route::Enter(next) => {
                if stage.notifications.on_exit {
                    events.push(event(NotificationKind::OnExit, instance, &stage.name, previous_assignees, now, Value::Null));
                }
                let target = definition
                    .stage(&next)
                    .ok_or_else(not_allowed)?;
                events.extend(
                    self.enter_stage(instance, definition, target, &performed_by, now)
                        .await,
                );
            }
        }

        Ok(events)
    }

    /// Decide where an action leads before any side effect runs
    fn route(
        &self,
        instance: &WorkflowInstance,
        definition: &WorkflowDefinition,
        stage: &Stage,
        action: &StageAction,
        task_id: &str,
        variables: &Value,
    ) -> WorkflowResult<Route> {
        let next = match &action.next_stage {
            Some(next) => Some(next.clone()),
            None if action.action_type == ActionType::Reject => return Ok(Route::Finish("rejected")),
            None if action.action_type.is_informational() => None,
            None => definition
                .transitions_from(&stage.name)
                .find(|t| t.condition.as_ref().map_or(true, |c| condition::evaluate(c, variables)))
                .map(|t| t.to.clone()),
        };
        let Some(next) = next else {
            return Ok(Route::Stay);
        };

        if stage.stage_type == StageType::Parallel && action.action_type != ActionType::Reject {
            let others = instance
                .pending_tasks
                .iter()
                .filter(|task| task.is_pending() && task.task_id != task_id)
                .count();
            if others > 0 {
                return Ok(Route::Stay);
            }
        }

        let target = definition
            .stage(&next)
            .ok_or_else(|| WorkflowError::ActionNotAllowed {
                stage: stage.name.clone(),
                action: action.name.clone(),
            })?;
        if target.order < stage.order && !definition.settings.allow_back {
            return Err(WorkflowError::ActionNotAllowed {
                stage: stage.name.clone(),
                action: action.name.clone(),
            });
        }
        Ok(Route::Enter(next))
    }

    /// Make `stage` current: finish on an end stage, otherwise resolve
    /// assignees and replace the pending tasks wholesale
    async fn enter_stage(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        stage: &Stage,
        by: &str,
        now: DateTime<Utc>,
    ) -> Vec<WorkflowEvent> {
        if stage.stage_type == StageType::End {
            instance.current_stage = stage.name.clone();
            instance.finish(InstanceStatus::Completed, "completed", by, now);
            tracing::info!("🏁 Workflow {} reached end stage '{}'", instance.id, stage.name);
            return vec![event(
                NotificationKind::OnComplete,
                instance,
                &stage.name,
                vec![instance.started_by.clone()],
                now,
                json!({ "status": "completed", "reason": "completed" }),
            )];
        }

        let context = ResolutionContext {
            manager_id: instance
                .variables
                .get(MANAGER_VARIABLE)
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        let assignees = self.resolver.resolve(stage, &context).await;
        if assignees.is_empty() {
            tracing::warn!(
                "⚠️ No assignees resolved for stage '{}' of {} ({}); instance is stalled",
                stage.name,
                instance.id,
                definition.name
            );
        }

        let due = due_date(stage, instance.deadline, now);
        instance.replace_pending_tasks(&stage.name, &assignees, now, due);
        tracing::info!("📍 Workflow {} entered stage '{}' -> {:?}", instance.id, stage.name, assignees);

        if stage.notifications.on_enter {
            vec![event(NotificationKind::OnEnter, instance, &stage.name, assignees, now, Value::Null)]
        } else {
            Vec::new()
        }
    }

    /// Load / mutate / guarded-write loop for synchronous mutations.
    /// Returning `Ok(None)` from `apply` skips the write.
    async fn commit<F>(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
        mut apply: F,
    ) -> WorkflowResult<WorkflowInstance>
    where
        F: FnMut(&mut WorkflowInstance, &WorkflowDefinition, DateTime<Utc>) -> WorkflowResult<Option<Vec<WorkflowEvent>>>,
    {
        let mut attempt = 0;
        loop {
            let mut instance = self.load(instance_id).await?;
            let definition = self.definitions.get(&instance.definition_id)?;
            let Some(events) = apply(&mut instance, &*definition, now)? else {
                return Ok(instance);
            };

            match self.instances.update(&mut instance).await {
                Ok(()) => {
                    self.notifier.emit_all(events);
                    return Ok(instance);
                }
                Err(WorkflowError::Conflict(_)) if attempt < self.max_conflict_retries => {
                    attempt += 1;
                    tracing::debug!("Retrying write on {} after conflict ({})", instance_id, attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn invoke_handler(&self, name: &str, ctx: &ActionContext<'_>) -> WorkflowResult<Option<Value>> {
        self.actions
            .invoke(name, ctx)
            .await
            .map_err(|e| WorkflowError::ActionFailed {
                action: name.to_string(),
                reason: e.to_string(),
            })
    }

    async fn load(&self, instance_id: &str) -> WorkflowResult<WorkflowInstance> {
        self.instances
            .get(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.to_string()))
    }
}

fn ensure_status(instance: &WorkflowInstance, expected: InstanceStatus) -> WorkflowResult<()> {
    if instance.status == expected {
        Ok(())
    } else {
        Err(WorkflowError::InvalidState {
            instance_id: instance.id.clone(),
            status: instance.status,
            expected,
        })
    }
}

fn not_assigned(instance: &WorkflowInstance, user_id: &str) -> WorkflowError {
    WorkflowError::NotAssigned {
        instance_id: instance.id.clone(),
        user_id: user_id.to_string(),
    }
}

fn current_stage<'d>(instance: &WorkflowInstance, definition: &'d WorkflowDefinition) -> WorkflowResult<&'d Stage> {
    definition.stage(&instance.current_stage).ok_or_else(|| {
        WorkflowError::InvalidDefinition(format!(
            "definition '{}' no longer has stage '{}'",
            definition.name, instance.current_stage
        ))
    })
}

/// Pending tasks of the current stage older than the stage timeout
fn expired_task_ids(instance: &WorkflowInstance, stage: &Stage, now: DateTime<Utc>) -> Vec<String> {
    let Some(timeout) = &stage.timeout else {
        return Vec::new();
    };
    let Some(limit) = timeout_span(timeout.duration) else {
        return Vec::new();
    };
    instance
        .pending_tasks
        .iter()
        .filter(|task| task.is_pending() && task.stage == stage.name && now - task.assigned_at > limit)
        .map(|task| task.task_id.clone())
        .collect()
}

fn due_date(stage: &Stage, deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    stage
        .timeout
        .as_ref()
        .and_then(|timeout| timeout_span(timeout.duration))
        .and_then(|span| now.checked_add_signed(span))
        .or(deadline)
}

/// Stage timeout as a signed span; `None` when it does not fit
fn timeout_span(duration_ms: u64) -> Option<Duration> {
    i64::try_from(duration_ms).ok().and_then(Duration::try_milliseconds)
}

fn event(
    kind: NotificationKind,
    instance: &WorkflowInstance,
    stage: &str,
    recipients: Vec<String>,
    at: DateTime<Utc>,
    detail: Value,
) -> WorkflowEvent {
    WorkflowEvent {
        kind,
        instance_id: instance.id.clone(),
        document_id: instance.document.document_id.clone(),
        definition_name: instance.definition_name.clone(),
        stage: stage.to_string(),
        recipients,
        occurred_at: at,
        detail,
    }
}
