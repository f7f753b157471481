//! Subagent execution contract. The gateway treats the runner as opaque and
//! only enforces the timeout.

use std::time::{Duration, Instant};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tracing::warn,
};

/// Used when a task does not carry its own timeout.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxTask {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl SandboxTask {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: None,
            prompt: prompt.into(),
            tools: Vec::new(),
            timeout_ms: None,
            metadata: Value::Null,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TASK_TIMEOUT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub sandboxed: bool,
}

impl SandboxResult {
    pub fn failure(error: impl Into<String>, duration: Duration, sandboxed: bool) -> Self {
        Self {
            success: false,
            response: None,
            error: Some(error.into()),
            duration_ms: duration.as_millis() as u64,
            sandboxed,
        }
    }
}

/// Executes subagent tasks, usually inside an isolated container.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Whether tasks run isolated from the gateway process.
    fn is_sandboxed(&self) -> bool {
        true
    }

    async fn run(&self, task: &SandboxTask) -> anyhow::Result<SandboxResult>;
}

/// Run `task`, turning runner errors and timeouts into failed results.
pub async fn run_with_timeout(
    runner: &dyn SandboxRunner,
    task: &SandboxTask,
    timeout: Duration,
) -> SandboxResult {
    let started = Instant::now();
    match tokio::time::timeout(timeout, runner.run(task)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            warn!(runner = runner.name(), task = %task.id, error = %e, "subagent run failed");
            SandboxResult::failure(e.to_string(), started.elapsed(), runner.is_sandboxed())
        },
        Err(_) => {
            warn!(
                runner = runner.name(),
                task = %task.id,
                timeout_ms = timeout.as_millis() as u64,
                "subagent run timed out"
            );
            SandboxResult::failure(
                format!("timed out after {}ms", timeout.as_millis()),
                started.elapsed(),
                runner.is_sandboxed(),
            )
        },
    }
}
