//! Assignee resolution
//!
//! Turns a stage's abstract assignment (user / role / department / manager /
//! custom) into concrete principal ids. Resolution never fails: an empty
//! result is a valid outcome that leaves the stage without pending tasks.

use crate::workflow::types::{AssigneeType, Stage};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::{collections::HashMap, path::Path, sync::Arc};

/// External membership lookup for roles and departments
#[async_trait]
pub trait Directory: Send + Sync {
    async fn role_members(&self, role: &str) -> Result<Vec<String>>;
    async fn department_members(&self, department: &str) -> Result<Vec<String>>;
}

/// Directory backed by a fixed membership table, loadable from JSON:
/// `{ "roles": { "reviewer": ["bob"] }, "departments": { "legal": ["lena"] } }`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticDirectory {
    #[serde(default)]
    pub roles: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub departments: HashMap<String, Vec<String>>,
}

impl StaticDirectory {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read directory file '{}': {}", path.display(), e))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn role_members(&self, role: &str) -> Result<Vec<String>> {
        Ok(self.roles.get(role).cloned().unwrap_or_default())
    }

    async fn department_members(&self, department: &str) -> Result<Vec<String>> {
        Ok(self.departments.get(department).cloned().unwrap_or_default())
    }
}

/// What the resolver may consult about the instance being routed
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    pub manager_id: Option<String>,
}

#[derive(Clone, Default)]
pub struct AssigneeResolver {
    directory: Option<Arc<dyn Directory>>,
}

impl AssigneeResolver {
    pub fn new(directory: Option<Arc<dyn Directory>>) -> Self {
        Self { directory }
    }

    /// Resolve a stage's assignment into distinct principal ids
    pub async fn resolve(&self, stage: &Stage, context: &ResolutionContext) -> Vec<String> {
        let Some(spec) = &stage.assignees else {
            return Vec::new();
        };

        let resolved = match spec.assignee_type {
            AssigneeType::User => spec.value.clone(),
            AssigneeType::Role | AssigneeType::Department => {
                self.resolve_group(spec.assignee_type, &spec.value).await
            }
            AssigneeType::Manager => context.manager_id.iter().cloned().collect(),
            AssigneeType::Custom => {
                tracing::warn!(
                    "Stage '{}' uses custom assignment ({:?}); expressions are not evaluated",
                    stage.name,
                    spec.expression
                );
                Vec::new()
            }
        };

        let mut distinct: Vec<String> = Vec::with_capacity(resolved.len());
        for principal in resolved {
            if !principal.is_empty() && !distinct.contains(&principal) {
                distinct.push(principal);
            }
        }
        distinct
    }

    /// Expand groups through the directory; without one (or when a lookup
    /// fails) the configured values are used as principal ids verbatim
    async fn resolve_group(&self, kind: AssigneeType, groups: &[String]) -> Vec<String> {
        let Some(directory) = &self.directory else {
            return groups.to_vec();
        };

        let mut principals = Vec::new();
        for group in groups {
            let members = match kind {
                AssigneeType::Role => directory.role_members(group).await,
                _ => directory.department_members(group).await,
            };
            match members {
                Ok(members) => principals.extend(members),
                Err(e) => {
                    tracing::warn!("Directory lookup for '{}' failed, using it verbatim: {}", group, e);
                    principals.push(group.clone());
                }
            }
        }
        principals
    }
}
