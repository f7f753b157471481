use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Error,
}

impl CheckStatus {
    pub fn from_result<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() { Self::Ok } else { Self::Error }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthChecks {
    pub database: CheckStatus,
    pub bus: CheckStatus,
}

impl HealthChecks {
    pub fn all_ok(&self) -> bool {
        self.database == CheckStatus::Ok && self.bus == CheckStatus::Ok
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub component: &'static str,
    pub version: &'static str,
    /// Seconds since the gateway was built.
    pub uptime: u64,
    pub checks: HealthChecks,
}

impl HealthReport {
    pub fn new(uptime: u64, checks: HealthChecks) -> Self {
        let status = if checks.all_ok() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        Self {
            status,
            component: "gateway",
            version: env!("CARGO_PKG_VERSION"),
            uptime,
            checks,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn any_failed_check_is_unhealthy() {
        let report = HealthReport::new(3, HealthChecks {
            database: CheckStatus::Ok,
            bus: CheckStatus::Error,
        });
        assert!(!report.is_healthy());
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], "unhealthy");
        assert_eq!(value["checks"], json!({"database": "ok", "bus": "error"}));
        assert_eq!(value["component"], "gateway");
    }
}
