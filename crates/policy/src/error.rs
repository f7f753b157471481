use std::path::PathBuf;

use serde::Serialize;

/// A problem found while validating one policy file. Collected per file and
/// exposed through [`crate::PolicyEngine::validation_errors`]; never returned
/// from evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{file}{}: {message}", rule_suffix(.rule_id))]
pub struct PolicyValidationError {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl PolicyValidationError {
    pub fn new(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            rule_id: None,
            message: message.into(),
            field: None,
        }
    }

    pub fn for_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn at(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

fn rule_suffix(rule_id: &Option<String>) -> String {
    rule_id
        .as_ref()
        .map(|id| format!(" (rule {id})"))
        .unwrap_or_default()
}

/// Failure of a whole load/reload attempt. The active rule table is left
/// untouched when this is returned.
#[derive(Debug, thiserror::Error)]
pub enum PolicyLoadError {
    #[error("policy directory {} is unreadable: {source}", .path.display())]
    DirectoryUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("policy watcher failed: {0}")]
    Watcher(String),
    #[error("policy reload task failed: {0}")]
    Task(String),
}
