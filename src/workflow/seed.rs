//! Bundled workflow templates
//!
//! Example definitions written to a fresh database at startup. They are
//! plain configuration; the engine treats them like any admin-created one.

use crate::error::WorkflowResult;
use crate::workflow::types::WorkflowDefinition;

const TEMPLATES: [(&str, &str); 3] = [
    ("document_approval", include_str!("seeds/document_approval.json")),
    ("contract_approval", include_str!("seeds/contract_approval.json")),
    ("invoice_approval", include_str!("seeds/invoice_approval.json")),
];

pub fn default_definitions() -> WorkflowResult<Vec<WorkflowDefinition>> {
    TEMPLATES
        .iter()
        .map(|(name, json)| {
            tracing::debug!("Loading bundled template: {}", name);
            Ok(serde_json::from_str(json)?)
        })
        .collect()
}
