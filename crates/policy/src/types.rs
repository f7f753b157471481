use {
    chrono::{DateTime, Utc},
    nachos_common::SecurityMode,
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

// ── Rule documents ──────────────────────────────────────────────────────────

/// One policy file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PolicyMetadata>,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mode: Option<SecurityMode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub priority: i64,
    #[serde(default, rename = "match")]
    pub matcher: RuleMatch,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Target selector. Every omitted field matches anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<MatchValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<MatchValue>,
    #[serde(default, rename = "resourceId", skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<MatchValue>,
}

impl RuleMatch {
    pub fn matches(&self, request: &SecurityRequest) -> bool {
        field_matches(self.resource.as_ref(), &request.resource.resource_type)
            && field_matches(self.action.as_ref(), &request.action)
            && field_matches(self.resource_id.as_ref(), &request.resource.id)
    }
}

fn field_matches(selector: Option<&MatchValue>, value: &str) -> bool {
    selector.is_none_or(|s| s.matches(value))
}

/// A scalar or a set of accepted values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchValue {
    One(String),
    Many(Vec<String>),
}

impl MatchValue {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::One(expected) => expected == value,
            Self::Many(set) => set.iter().any(|v| v == value),
        }
    }

    pub fn values(&self) -> &[String] {
        match self {
            Self::One(v) => std::slice::from_ref(v),
            Self::Many(set) => set,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Contains,
    Matches,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    #[default]
    Deny,
}

impl Effect {
    pub fn is_allow(self) -> bool {
        matches!(self, Self::Allow)
    }
}

// ── Requests and decisions ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
}

/// Authorization question handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityRequest {
    pub request_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub security_mode: SecurityMode,
    pub resource: Resource,
    pub action: String,
    #[serde(default)]
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl SecurityRequest {
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: String::new(),
            session_id: String::new(),
            security_mode: SecurityMode::default(),
            resource: Resource {
                resource_type: resource_type.into(),
                id: resource_id.into(),
            },
            action: action.into(),
            metadata: Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_mode(mut self, mode: SecurityMode) -> Self {
        self.security_mode = mode;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Outcome of one evaluation. A deny is an ordinary result, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityResult {
    pub allowed: bool,
    pub effect: Effect,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub evaluation_time_ms: f64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_rule_with_scalar_and_set_matches() {
        let yaml = r#"
id: allow-tools
priority: 50
match:
  resource: tool
  action: [invoke, describe]
  resourceId: browser
effect: allow
"#;
        let rule: PolicyRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.matcher.resource, Some(MatchValue::One("tool".into())));
        assert_eq!(
            rule.matcher.action,
            Some(MatchValue::Many(vec!["invoke".into(), "describe".into()]))
        );
        assert!(rule.conditions.is_empty());
        assert_eq!(rule.effect, Effect::Allow);
    }

    #[test]
    fn empty_match_matches_everything() {
        let req = SecurityRequest::new("tool", "shell", "invoke");
        assert!(RuleMatch::default().matches(&req));
    }

    #[test]
    fn set_match_checks_membership() {
        let m = RuleMatch {
            resource_id: Some(MatchValue::Many(vec!["a".into(), "b".into()])),
            ..Default::default()
        };
        assert!(m.matches(&SecurityRequest::new("tool", "b", "invoke")));
        assert!(!m.matches(&SecurityRequest::new("tool", "c", "invoke")));
    }

    #[test]
    fn result_serializes_camel_case() {
        let result = SecurityResult {
            allowed: true,
            effect: Effect::Allow,
            rule_id: Some("r1".into()),
            reason: None,
            evaluation_time_ms: 0.01,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["ruleId"], "r1");
        assert_eq!(json["effect"], "allow");
        assert!(json.get("reason").is_none());
    }
}
