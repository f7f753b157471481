use {
    chrono::{DateTime, Utc},
    nachos_common::SecurityMode,
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    Error,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allowed" => Some(Self::Allowed),
            "denied" => Some(Self::Denied),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One security-relevant event. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub instance_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    pub event_type: String,
    pub action: String,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub security_mode: SecurityMode,
    /// Free-form extension fields, written inline next to the fixed ones.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AuditEvent {
    pub fn new(
        instance_id: impl Into<String>,
        event_type: impl Into<String>,
        action: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            instance_id: instance_id.into(),
            user_id: None,
            session_id: None,
            channel: None,
            event_type: event_type.into(),
            action: action.into(),
            outcome,
            security_mode: SecurityMode::default(),
            extra: Map::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_mode(mut self, mode: SecurityMode) -> Self {
        self.security_mode = mode;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Filter for providers that can read events back.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub event_type: Option<String>,
    pub outcome: Option<AuditOutcome>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl AuditQuery {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        fn eq(filter: &Option<String>, value: Option<&str>) -> bool {
            filter.as_deref().is_none_or(|f| value == Some(f))
        }

        self.from.is_none_or(|from| event.timestamp >= from)
            && self.to.is_none_or(|to| event.timestamp <= to)
            && eq(&self.user_id, event.user_id.as_deref())
            && eq(&self.session_id, event.session_id.as_deref())
            && eq(&self.event_type, Some(&event.event_type))
            && self.outcome.is_none_or(|o| o == event.outcome)
    }

    /// Filter, then apply offset and limit.
    pub fn apply(&self, events: impl IntoIterator<Item = AuditEvent>) -> Vec<AuditEvent> {
        events
            .into_iter()
            .filter(|e| self.matches(e))
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn extension_fields_are_inline() {
        let event = AuditEvent::new("gw-1", "policy.decision", "tool.invoke", AuditOutcome::Denied)
            .with_user("alice")
            .with_field("ruleId", "deny-all");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["instanceId"], "gw-1");
        assert_eq!(json["outcome"], "denied");
        assert_eq!(json["ruleId"], "deny-all");
        assert_eq!(json["securityMode"], "standard");

        let back: AuditEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.extra.get("ruleId"), Some(&json!("deny-all")));
    }

    #[test]
    fn query_filters_and_paginates() {
        let events: Vec<_> = (0..5)
            .map(|i| {
                let outcome = if i % 2 == 0 {
                    AuditOutcome::Allowed
                } else {
                    AuditOutcome::Denied
                };
                AuditEvent::new("gw", "message.received", "message", outcome).with_user("u1")
            })
            .collect();

        let query = AuditQuery {
            outcome: Some(AuditOutcome::Allowed),
            offset: 1,
            limit: Some(1),
            ..Default::default()
        };
        let page = query.apply(events.clone());
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, events[2].id);

        let nobody = AuditQuery {
            user_id: Some("u2".into()),
            ..Default::default()
        };
        assert!(nobody.apply(events).is_empty());
    }
}
