use std::{fmt, str::FromStr};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Ended,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Ended => "ended",
        }
    }

    /// `active ⇄ paused`, `active → ended`, and reactivation of paused or
    /// ended sessions. Staying in the same status is always allowed.
    pub fn can_transition_to(self, next: Self) -> bool {
        use SessionStatus::*;
        self == next
            || matches!(
                (self, next),
                (Active, Paused) | (Active, Ended) | (Paused, Active) | (Ended, Active)
            )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "ended" => Ok(Self::Ended),
            other => Err(format!("unknown session status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub channel: String,
    pub conversation_id: String,
    pub user_id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub config: Value,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Fields for a session that does not exist yet.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub channel: String,
    pub conversation_id: String,
    pub user_id: String,
    pub system_prompt: Option<String>,
    pub config: Option<Value>,
    pub metadata: Option<Value>,
}

impl NewSession {
    pub fn new(
        channel: impl Into<String>,
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message role {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Generated when absent.
    pub id: Option<String>,
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Option<Value>,
}

impl NewMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: content.into(),
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Value) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    pub(crate) fn into_message(self, session_id: &str, now: DateTime<Utc>) -> Message {
        Message {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            session_id: session_id.to_string(),
            role: self.role,
            content: self.content,
            tool_calls: self.tool_calls,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub channel: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<SessionStatus>,
    pub limit: Option<usize>,
}
