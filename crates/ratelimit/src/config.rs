use std::fmt;

use {
    nachos_common::SecurityMode,
    serde::{Deserialize, Serialize},
};

/// Rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Trailing window length in milliseconds.
    pub window_ms: u64,
    /// Per-type ceilings replacing the security-mode preset.
    pub overrides: LimitOverrides,
    /// Shared counter store. When unset, counts are kept in-process only.
    pub redis_url: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            overrides: LimitOverrides::default(),
            redis_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitOverrides {
    pub messages_per_minute: Option<u32>,
    pub tool_calls_per_minute: Option<u32>,
    pub llm_requests_per_minute: Option<u32>,
}

/// The throttled action. Used as the key prefix in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    Message,
    ToolCall,
    LlmRequest,
}

impl LimitType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::ToolCall => "tool_call",
            Self::LlmRequest => "llm_request",
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effective ceilings per window. `0` disables limiting for that type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub messages_per_minute: u32,
    pub tool_calls_per_minute: u32,
    pub llm_requests_per_minute: u32,
}

impl RateLimits {
    pub fn for_mode(mode: SecurityMode) -> Self {
        match mode {
            SecurityMode::Strict => Self {
                messages_per_minute: 10,
                tool_calls_per_minute: 5,
                llm_requests_per_minute: 5,
            },
            SecurityMode::Standard => Self {
                messages_per_minute: 30,
                tool_calls_per_minute: 20,
                llm_requests_per_minute: 20,
            },
            SecurityMode::Permissive => Self {
                messages_per_minute: 120,
                tool_calls_per_minute: 100,
                llm_requests_per_minute: 60,
            },
        }
    }

    pub fn with_overrides(mut self, overrides: &LimitOverrides) -> Self {
        if let Some(v) = overrides.messages_per_minute {
            self.messages_per_minute = v;
        }
        if let Some(v) = overrides.tool_calls_per_minute {
            self.tool_calls_per_minute = v;
        }
        if let Some(v) = overrides.llm_requests_per_minute {
            self.llm_requests_per_minute = v;
        }
        self
    }

    pub fn limit_for(&self, limit_type: LimitType) -> u32 {
        match limit_type {
            LimitType::Message => self.messages_per_minute,
            LimitType::ToolCall => self.tool_calls_per_minute,
            LimitType::LlmRequest => self.llm_requests_per_minute,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn presets_tighten_with_mode() {
        let strict = RateLimits::for_mode(SecurityMode::Strict);
        let permissive = RateLimits::for_mode(SecurityMode::Permissive);
        assert!(strict.messages_per_minute < permissive.messages_per_minute);
        assert!(strict.tool_calls_per_minute < permissive.tool_calls_per_minute);
    }

    #[test]
    fn overrides_replace_single_types() {
        let limits = RateLimits::for_mode(SecurityMode::Standard).with_overrides(&LimitOverrides {
            tool_calls_per_minute: Some(0),
            ..Default::default()
        });
        assert_eq!(limits.limit_for(LimitType::ToolCall), 0);
        assert_eq!(limits.limit_for(LimitType::Message), 30);
    }
}
