//! Structural validation of workflow definitions
//!
//! Hard failures reject the definition with `InvalidDefinition`. Softer
//! findings (stages nobody can reach, no way to finish) come back as
//! warnings; stage graphs may legitimately contain cycles (reject back to
//! draft), so reachability is checked instead of acyclicity.

use crate::error::{WorkflowError, WorkflowResult};
use crate::workflow::types::{ActionType, StageType, TimeoutAction, WorkflowDefinition};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

/// Longest accepted stage timeout: ten years
pub const MAX_TIMEOUT_MS: u64 = 10 * 365 * 24 * 60 * 60 * 1000;

/// Validate a definition, returning non-fatal warnings on success
pub fn validate_definition(definition: &WorkflowDefinition) -> WorkflowResult<Vec<String>> {
    if definition.name.trim().is_empty() {
        return Err(invalid("definition name must not be empty"));
    }
    if definition.stages.is_empty() {
        return Err(invalid(format!("'{}' declares no stages", definition.name)));
    }

    let mut names = HashSet::new();
    for stage in &definition.stages {
        if stage.name.trim().is_empty() {
            return Err(invalid("stage names must not be empty"));
        }
        if !names.insert(stage.name.as_str()) {
            return Err(invalid(format!("duplicate stage name '{}'", stage.name)));
        }
    }

    let starts: Vec<&str> = definition
        .stages
        .iter()
        .filter(|stage| stage.stage_type == StageType::Start)
        .map(|stage| stage.name.as_str())
        .collect();
    match starts.len() {
        0 => return Err(invalid(format!("'{}' has no start stage", definition.name))),
        1 => {}
        _ => {
            return Err(invalid(format!(
                "'{}' has more than one start stage: {}",
                definition.name,
                starts.join(", ")
            )))
        }
    }
    if definition.stages.len() < 2 {
        return Err(invalid(format!(
            "'{}' needs at least one stage after its start stage",
            definition.name
        )));
    }

    for stage in &definition.stages {
        for action in &stage.actions {
            if let Some(next) = &action.next_stage {
                if !names.contains(next.as_str()) {
                    return Err(invalid(format!(
                        "action '{}' on stage '{}' targets unknown stage '{}'",
                        action.name, stage.name, next
                    )));
                }
            }
        }

        if let Some(timeout) = &stage.timeout {
            if timeout.duration == 0 {
                return Err(invalid(format!(
                    "stage '{}' has a zero timeout duration",
                    stage.name
                )));
            }
            if timeout.duration > MAX_TIMEOUT_MS {
                return Err(invalid(format!(
                    "stage '{}' timeout of {} ms exceeds the {} ms limit",
                    stage.name, timeout.duration, MAX_TIMEOUT_MS
                )));
            }
            if timeout.action == TimeoutAction::Escalate && timeout.escalate_to.is_empty() {
                return Err(invalid(format!(
                    "stage '{}' escalates on timeout but names no escalateTo principals",
                    stage.name
                )));
            }
        }
    }

    for transition in &definition.transitions {
        for endpoint in [&transition.from, &transition.to] {
            if !names.contains(endpoint.as_str()) {
                return Err(invalid(format!(
                    "transition {} -> {} references unknown stage '{}'",
                    transition.from, transition.to, endpoint
                )));
            }
        }
    }

    Ok(reachability_warnings(definition, starts[0]))
}

/// Walk the stage graph from the start stage and report dead ends
fn reachability_warnings(definition: &WorkflowDefinition, start: &str) -> Vec<String> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for stage in &definition.stages {
        index.insert(stage.name.as_str(), graph.add_node(stage.name.as_str()));
    }

    for stage in &definition.stages {
        for next in stage.actions.iter().filter_map(|a| a.next_stage.as_deref()) {
            graph.add_edge(index[stage.name.as_str()], index[next], ());
        }
    }
    for transition in &definition.transitions {
        graph.add_edge(
            index[transition.from.as_str()],
            index[transition.to.as_str()],
            (),
        );
    }

    let mut reachable = HashSet::new();
    let mut dfs = Dfs::new(&graph, index[start]);
    while let Some(node) = dfs.next(&graph) {
        reachable.insert(graph[node]);
    }

    // Without transitions out of start the engine falls back to the next stage by order
    if definition.transitions_from(start).next().is_none() {
        if let Some(next) = definition.stage_after(start) {
            let mut dfs = Dfs::new(&graph, index[next.name.as_str()]);
            while let Some(node) = dfs.next(&graph) {
                reachable.insert(graph[node]);
            }
        }
    }

    let mut warnings: Vec<String> = definition
        .stages
        .iter()
        .filter(|stage| !reachable.contains(stage.name.as_str()))
        .map(|stage| format!("stage '{}' is unreachable from '{}'", stage.name, start))
        .collect();

    let can_finish = definition.stages.iter().any(|stage| {
        reachable.contains(stage.name.as_str())
            && (stage.stage_type == StageType::End
                || stage
                    .actions
                    .iter()
                    .any(|a| a.action_type == ActionType::Reject && a.next_stage.is_none()))
    });
    if !can_finish {
        warnings.push(format!(
            "'{}' has no reachable end stage or terminating reject",
            definition.name
        ));
    }

    warnings
}

fn invalid(message: impl Into<String>) -> WorkflowError {
    WorkflowError::InvalidDefinition(message.into())
}
