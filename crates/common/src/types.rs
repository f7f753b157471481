use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Deployment security posture. Selects rate-limit presets and is stamped on
/// every policy request and audit event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    Strict,
    #[default]
    Standard,
    Permissive,
}

impl SecurityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Standard => "standard",
            Self::Permissive => "permissive",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown security mode: {0}")]
pub struct UnknownSecurityMode(pub String);

impl FromStr for SecurityMode {
    type Err = UnknownSecurityMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "standard" => Ok(Self::Standard),
            "permissive" => Ok(Self::Permissive),
            other => Err(UnknownSecurityMode(other.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("STRICT".parse::<SecurityMode>().unwrap(), SecurityMode::Strict);
        assert_eq!(" permissive ".parse::<SecurityMode>().unwrap(), SecurityMode::Permissive);
        assert!("lenient".parse::<SecurityMode>().is_err());
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&SecurityMode::Standard).unwrap();
        assert_eq!(json, "\"standard\"");
    }
}
