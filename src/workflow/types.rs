//! Workflow definition types
//!
//! A definition is a named template: an ordered set of stages, the actions
//! each stage permits, fallback transitions between stages and
//! definition-wide settings. Definitions are serialized as camelCase JSON
//! both on the wire and in the `workflow_definitions` table.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A complete workflow template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Storage identifier, assigned on create when empty
    #[serde(default)]
    pub id: String,
    /// Unique human-facing name (e.g. "document_approval")
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Free-form grouping (e.g. "approval", "contract", "finance")
    #[serde(default = "default_category")]
    pub category: String,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub settings: WorkflowSettings,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

/// Definition-wide behaviour switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    /// Actions may route to a stage with a lower `order`
    #[serde(default = "default_true")]
    pub allow_back: bool,
    #[serde(default = "default_true")]
    pub allow_cancel: bool,
    #[serde(default = "default_true")]
    pub allow_delegate: bool,
    #[serde(default)]
    pub require_comment_on_reject: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            allow_back: true,
            allow_cancel: true,
            allow_delegate: true,
            require_comment_on_reject: false,
        }
    }
}

/// A single step of the workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    /// Unique within the definition
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub order: u32,
    #[serde(rename = "type")]
    pub stage_type: StageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignees: Option<AssigneeSpec>,
    #[serde(default)]
    pub actions: Vec<StageAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<StageTimeout>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub notifications: StageNotifications,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    Start,
    Review,
    Approval,
    /// Every assignee must approve before the stage advances
    Parallel,
    End,
}

/// Abstract assignment for a stage, resolved to principals at entry time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssigneeSpec {
    #[serde(rename = "type")]
    pub assignee_type: AssigneeType,
    #[serde(default)]
    pub value: Vec<String>,
    /// Declared for `custom` assignment; never evaluated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeType {
    User,
    Role,
    Department,
    Manager,
    Custom,
}

/// An action a stage assignee may perform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAction {
    pub name: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stage: Option<String>,
    /// All must hold against the instance variables for this entry to apply
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl StageAction {
    /// Whether a requested action string selects this entry.
    ///
    /// Built-in types match on their type name; `custom` entries match on
    /// the action name.
    pub fn matches(&self, requested: &str) -> bool {
        match self.action_type {
            ActionType::Custom => self.name == requested,
            other => other.as_str() == requested,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Approve,
    Reject,
    Delegate,
    Comment,
    Attach,
    Custom,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Delegate => "delegate",
            Self::Comment => "comment",
            Self::Attach => "attach",
            Self::Custom => "custom",
        }
    }

    /// Comment and attach record history without resolving the caller's task
    pub fn is_informational(&self) -> bool {
        matches!(self, Self::Comment | Self::Attach)
    }
}

/// Timeout policy for a stage's pending tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTimeout {
    /// Milliseconds a task may stay pending
    pub duration: u64,
    pub action: TimeoutAction,
    #[serde(default)]
    pub escalate_to: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    Escalate,
    AutoApprove,
    AutoReject,
    Notify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageNotifications {
    #[serde(default = "default_true")]
    pub on_enter: bool,
    #[serde(default = "default_true")]
    pub on_exit: bool,
    #[serde(default = "default_true")]
    pub on_timeout: bool,
}

impl Default for StageNotifications {
    fn default() -> Self {
        Self {
            on_enter: true,
            on_exit: true,
            on_timeout: true,
        }
    }
}

/// Definition-level edge, the fallback when an action names no next stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub auto: bool,
}

/// A tagged comparison against one field of the instance variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// JSONPath into the variables (`$.amount`); a bare key is accepted
    pub field: String,
    pub op: ConditionOp,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Exists,
}

impl WorkflowDefinition {
    /// Look up a stage by name
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// The single `start`-typed stage
    pub fn start_stage(&self) -> Option<&Stage> {
        self.stages
            .iter()
            .find(|stage| stage.stage_type == StageType::Start)
    }

    /// Stage following `stage_name` in `order`, ties kept in declaration order
    pub fn stage_after(&self, stage_name: &str) -> Option<&Stage> {
        let mut ordered: Vec<&Stage> = self.stages.iter().collect();
        ordered.sort_by_key(|stage| stage.order);
        let position = ordered.iter().position(|stage| stage.name == stage_name)?;
        ordered.get(position + 1).copied()
    }

    /// Transitions leaving `stage_name`, in declaration order
    pub fn transitions_from<'a>(
        &'a self,
        stage_name: &'a str,
    ) -> impl Iterator<Item = &'a Transition> + 'a {
        self.transitions
            .iter()
            .filter(move |transition| transition.from == stage_name)
    }
}

fn default_true() -> bool {
    true
}

fn default_category() -> String {
    "general".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_camel_case_definition() {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "name": "memo",
            "stages": [
                { "name": "draft", "order": 0, "type": "start",
                  "actions": [{ "name": "submit", "type": "approve", "nextStage": "done" }] },
                { "name": "done", "order": 1, "type": "end" }
            ],
            "settings": { "requireCommentOnReject": true }
        }))
        .unwrap();

        assert!(definition.is_active);
        assert_eq!(definition.category, "general");
        assert!(definition.settings.allow_back);
        assert!(definition.settings.require_comment_on_reject);
        assert_eq!(definition.start_stage().unwrap().name, "draft");
        assert_eq!(
            definition.stages[0].actions[0].next_stage.as_deref(),
            Some("done")
        );
        assert!(definition.stages[1].notifications.on_enter);
    }

    #[test]
    fn stage_after_follows_order_not_declaration() {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "name": "out_of_order",
            "stages": [
                { "name": "end", "order": 2, "type": "end" },
                { "name": "start", "order": 0, "type": "start" },
                { "name": "review", "order": 1, "type": "review" }
            ]
        }))
        .unwrap();

        assert_eq!(definition.stage_after("start").unwrap().name, "review");
        assert_eq!(definition.stage_after("review").unwrap().name, "end");
        assert!(definition.stage_after("end").is_none());
    }

    #[test]
    fn custom_actions_match_by_name() {
        let builtin = StageAction {
            name: "sign_off".into(),
            action_type: ActionType::Approve,
            next_stage: None,
            conditions: vec![],
        };
        let custom = StageAction {
            name: "request_legal".into(),
            action_type: ActionType::Custom,
            next_stage: None,
            conditions: vec![],
        };

        assert!(builtin.matches("approve"));
        assert!(!builtin.matches("sign_off"));
        assert!(custom.matches("request_legal"));
        assert!(!custom.matches("custom"));
    }
}
