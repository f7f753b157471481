//! Directory scanning and per-file validation of policy documents.

use std::path::{Path, PathBuf};

use {
    regex::Regex,
    serde_json::Value,
    tracing::{debug, warn},
};

use crate::{
    error::{PolicyLoadError, PolicyValidationError},
    types::{ConditionOperator, MatchValue, PolicyDocument},
};

/// A document that passed validation, with the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub file: PathBuf,
    pub document: PolicyDocument,
}

/// Result of scanning a directory: every valid document in scan order plus
/// the errors of every file that was excluded.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub documents: Vec<LoadedDocument>,
    pub errors: Vec<PolicyValidationError>,
}

impl LoadReport {
    pub fn rule_count(&self) -> usize {
        self.documents.iter().map(|d| d.document.rules.len()).sum()
    }
}

/// Returns true for `.yaml` / `.yml` files.
pub fn is_policy_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    )
}

pub struct PolicyLoader {
    dir: PathBuf,
}

impl PolicyLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scan the directory (non-recursive, file-name order) and load every
    /// policy file independently. Only an unreadable directory fails the
    /// whole load.
    pub fn load(&self) -> Result<LoadReport, PolicyLoadError> {
        let unreadable = |source| PolicyLoadError::DirectoryUnreadable {
            path: self.dir.clone(),
            source,
        };

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(unreadable)? {
            let path = entry.map_err(unreadable)?.path();
            if path.is_file() && is_policy_file(&path) {
                files.push(path);
            }
        }
        files.sort();

        let mut report = LoadReport::default();
        for file in files {
            match Self::load_file(&file) {
                Ok(document) => {
                    debug!(file = %file.display(), rules = document.rules.len(), "loaded policy file");
                    report.documents.push(LoadedDocument { file, document });
                },
                Err(errors) => {
                    for e in &errors {
                        warn!(error = %e, "policy file rejected");
                    }
                    report.errors.extend(errors);
                },
            }
        }
        Ok(report)
    }

    /// Read, parse and validate one file.
    pub fn load_file(path: &Path) -> Result<PolicyDocument, Vec<PolicyValidationError>> {
        let label = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            vec![PolicyValidationError::new(&label, format!("failed to read file: {e}"))]
        })?;
        parse_document(&raw, &label)
    }
}

/// Parse and validate one document's text. `file` is only used for error
/// attribution.
pub fn parse_document(raw: &str, file: &str) -> Result<PolicyDocument, Vec<PolicyValidationError>> {
    let document: PolicyDocument = serde_yaml::from_str(raw)
        .map_err(|e| vec![PolicyValidationError::new(file, format!("invalid document: {e}"))])?;

    let errors = validate_document(&document, file);
    if errors.is_empty() {
        Ok(document)
    } else {
        Err(errors)
    }
}

/// Semantic checks that serde cannot express.
pub fn validate_document(doc: &PolicyDocument, file: &str) -> Vec<PolicyValidationError> {
    let mut errors = Vec::new();

    if doc.version.trim().is_empty() {
        errors.push(PolicyValidationError::new(file, "version must not be empty").at("version"));
    }

    for (idx, rule) in doc.rules.iter().enumerate() {
        let base = format!("rules[{idx}]");
        if rule.id.trim().is_empty() {
            errors.push(
                PolicyValidationError::new(file, "rule id must not be empty").at(format!("{base}.id")),
            );
        }

        let selectors = [
            ("resource", rule.matcher.resource.as_ref()),
            ("action", rule.matcher.action.as_ref()),
            ("resourceId", rule.matcher.resource_id.as_ref()),
        ];
        for (name, selector) in selectors {
            if let Some(MatchValue::Many(set)) = selector
                && set.is_empty()
            {
                errors.push(
                    PolicyValidationError::new(file, "match set must not be empty")
                        .for_rule(&rule.id)
                        .at(format!("{base}.match.{name}")),
                );
            }
        }

        for (cidx, cond) in rule.conditions.iter().enumerate() {
            let at = format!("{base}.conditions[{cidx}]");
            if cond.field.trim().is_empty() {
                errors.push(
                    PolicyValidationError::new(file, "condition field must not be empty")
                        .for_rule(&rule.id)
                        .at(format!("{at}.field")),
                );
            }
            if let Some(message) = check_condition_value(cond.operator, &cond.value) {
                errors.push(
                    PolicyValidationError::new(file, message)
                        .for_rule(&rule.id)
                        .at(format!("{at}.value")),
                );
            }
        }
    }

    errors
}

fn check_condition_value(operator: ConditionOperator, value: &Value) -> Option<String> {
    match operator {
        ConditionOperator::In | ConditionOperator::NotIn if !value.is_array() => {
            Some("operator requires a list value".into())
        },
        ConditionOperator::StartsWith | ConditionOperator::EndsWith if !value.is_string() => {
            Some("operator requires a string value".into())
        },
        ConditionOperator::Matches => match value.as_str() {
            Some(pattern) => Regex::new(pattern)
                .err()
                .map(|e| format!("invalid pattern: {e}")),
            None => Some("operator requires a string pattern".into()),
        },
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, crate::types::Effect};

    const VALID: &str = r#"
version: "1"
metadata:
  name: base
  mode: standard
rules:
  - id: allow-browser
    priority: 100
    match:
      resource: tool
      resourceId: browser
    effect: allow
  - id: deny-all
    priority: 10
    match: {}
    effect: deny
    reason: default deny
"#;

    #[test]
    fn parses_valid_document() {
        let doc = parse_document(VALID, "base.yaml").unwrap();
        assert_eq!(doc.rules.len(), 2);
        assert_eq!(doc.rules[1].effect, Effect::Deny);
        assert_eq!(doc.metadata.and_then(|m| m.name).as_deref(), Some("base"));
    }

    #[test]
    fn reports_bad_regex_with_rule_and_field() {
        let raw = r#"
version: "1"
rules:
  - id: r1
    priority: 1
    conditions:
      - field: metadata.text
        operator: matches
        value: "([unclosed"
    effect: deny
"#;
        let errors = parse_document(raw, "bad.yaml").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].rule_id.as_deref(), Some("r1"));
        assert_eq!(errors[0].field.as_deref(), Some("rules[0].conditions[0].value"));
    }

    #[test]
    fn rejects_unknown_effect() {
        let raw = "version: '1'\nrules:\n  - id: r\n    priority: 1\n    effect: maybe\n";
        let errors = parse_document(raw, "x.yaml").unwrap_err();
        assert!(errors[0].message.contains("invalid document"));
    }

    #[test]
    fn rejects_scalar_for_in_operator() {
        let raw = r#"
version: "1"
rules:
  - id: r
    priority: 1
    conditions:
      - { field: userId, operator: in, value: alice }
    effect: allow
"#;
        let errors = parse_document(raw, "x.yaml").unwrap_err();
        assert!(errors[0].message.contains("list"));
    }

    #[test]
    fn invalid_file_does_not_block_siblings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), VALID).unwrap();
        std::fs::write(dir.path().join("b.yml"), "version: ''\nrules: []\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let report = PolicyLoader::new(dir.path()).load().unwrap();
        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.rule_count(), 2);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].file.ends_with("b.yml"));
    }

    #[test]
    fn scan_order_is_by_file_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20-late.yaml"), "version: '1'\n").unwrap();
        std::fs::write(dir.path().join("10-early.yaml"), "version: '1'\n").unwrap();

        let report = PolicyLoader::new(dir.path()).load().unwrap();
        let names: Vec<_> = report
            .documents
            .iter()
            .filter_map(|d| d.file.file_name().and_then(|n| n.to_str()).map(String::from))
            .collect();
        assert_eq!(names, vec!["10-early.yaml", "20-late.yaml"]);
    }

    #[test]
    fn missing_directory_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = PolicyLoader::new(dir.path().join("nope")).load();
        assert!(matches!(
            result,
            Err(PolicyLoadError::DirectoryUnreadable { .. })
        ));
    }
}
