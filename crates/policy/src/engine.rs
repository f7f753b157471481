use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    arc_swap::ArcSwap,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    tracing::{info, warn},
};

use crate::{
    error::{PolicyLoadError, PolicyValidationError},
    evaluator::{PolicyEvaluator, RuleTable},
    loader::PolicyLoader,
    types::{Effect, SecurityRequest, SecurityResult},
};

/// Policy engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyEngineConfig {
    /// When false, callers skip policy checks entirely.
    pub enabled: bool,
    /// Directory scanned for `*.yaml` / `*.yml` rule documents.
    pub policies_dir: PathBuf,
    /// Effect applied when no rule matches.
    pub default_effect: Effect,
    /// Reload automatically when files in `policies_dir` change.
    pub watch: bool,
    /// Window in which bursts of file events collapse into one reload.
    pub debounce_ms: u64,
}

impl Default for PolicyEngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policies_dir: PathBuf::from("policies"),
            default_effect: Effect::Deny,
            watch: false,
            debounce_ms: 100,
        }
    }
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStats {
    pub policies_loaded: usize,
    pub rules_active: usize,
    pub evaluations_total: u64,
    pub average_evaluation_ms: f64,
    pub reloads_total: u64,
    pub last_reload: Option<DateTime<Utc>>,
}

/// What a successful reload installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadSummary {
    pub documents: usize,
    pub rules: usize,
    pub invalid_files: usize,
}

pub type ReloadCallback = Arc<dyn Fn(&ReloadSummary) + Send + Sync>;
pub type ReloadErrorCallback = Arc<dyn Fn(&PolicyLoadError) + Send + Sync>;

#[derive(Default)]
struct Counters {
    evaluations: AtomicU64,
    eval_nanos: AtomicU64,
    reloads: AtomicU64,
}

/// Authorizes [`SecurityRequest`]s against a hot-reloadable rule directory.
///
/// `evaluate` is synchronous and lock-free. `reload` parses and validates
/// every file before installing the new table in a single swap; when the
/// directory itself cannot be read the previous table stays active.
pub struct PolicyEngine {
    config: PolicyEngineConfig,
    loader: PolicyLoader,
    evaluator: PolicyEvaluator,
    validation_errors: ArcSwap<Vec<PolicyValidationError>>,
    last_reload: ArcSwap<Option<DateTime<Utc>>>,
    counters: Counters,
    on_reload: Option<ReloadCallback>,
    on_error: Option<ReloadErrorCallback>,
}

impl PolicyEngine {
    /// Build an engine with an empty rule table. Call [`Self::initialize`]
    /// to perform the first load.
    pub fn new(config: PolicyEngineConfig) -> Self {
        Self {
            loader: PolicyLoader::new(config.policies_dir.clone()),
            evaluator: PolicyEvaluator::new(config.default_effect),
            validation_errors: ArcSwap::from_pointee(Vec::new()),
            last_reload: ArcSwap::from_pointee(None),
            counters: Counters::default(),
            on_reload: None,
            on_error: None,
            config,
        }
    }

    pub fn with_reload_callback(
        mut self,
        f: impl Fn(&ReloadSummary) + Send + Sync + 'static,
    ) -> Self {
        self.on_reload = Some(Arc::new(f));
        self
    }

    pub fn with_error_callback(
        mut self,
        f: impl Fn(&PolicyLoadError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn config(&self) -> &PolicyEngineConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// First load. Identical to [`Self::reload`].
    pub fn initialize(&self) -> Result<ReloadSummary, PolicyLoadError> {
        self.reload()
    }

    /// Re-scan the policy directory and swap in the result.
    ///
    /// Per-file failures are recorded in [`Self::validation_errors`]; a
    /// directory with no valid documents still installs an empty table so the
    /// default effect takes over.
    pub fn reload(&self) -> Result<ReloadSummary, PolicyLoadError> {
        let report = match self.loader.load() {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "policy reload failed, keeping previous rules");
                if let Some(cb) = &self.on_error {
                    cb(&e);
                }
                return Err(e);
            },
        };

        let table = RuleTable::compile(&report.documents);
        let summary = ReloadSummary {
            documents: table.document_count(),
            rules: table.len(),
            invalid_files: count_files(&report.errors),
        };

        self.evaluator.replace(table);
        self.validation_errors.store(Arc::new(report.errors));
        self.last_reload.store(Arc::new(Some(Utc::now())));
        self.counters.reloads.fetch_add(1, Ordering::Relaxed);

        if summary.documents == 0 {
            warn!(
                dir = %self.loader.dir().display(),
                "no valid policy documents, default effect applies to every request"
            );
        }
        info!(
            documents = summary.documents,
            rules = summary.rules,
            invalid_files = summary.invalid_files,
            "policies loaded"
        );
        if let Some(cb) = &self.on_reload {
            cb(&summary);
        }
        Ok(summary)
    }

    pub fn evaluate(&self, request: &SecurityRequest) -> SecurityResult {
        let result = self.evaluator.evaluate(request);
        self.counters.evaluations.fetch_add(1, Ordering::Relaxed);
        self.counters
            .eval_nanos
            .fetch_add((result.evaluation_time_ms * 1_000_000.0) as u64, Ordering::Relaxed);
        result
    }

    /// Errors from the files rejected by the last successful reload.
    pub fn validation_errors(&self) -> Vec<PolicyValidationError> {
        self.validation_errors.load().as_ref().clone()
    }

    pub fn stats(&self) -> PolicyStats {
        let table = self.evaluator.table();
        let evaluations = self.counters.evaluations.load(Ordering::Relaxed);
        let nanos = self.counters.eval_nanos.load(Ordering::Relaxed);
        PolicyStats {
            policies_loaded: table.document_count(),
            rules_active: table.len(),
            evaluations_total: evaluations,
            average_evaluation_ms: if evaluations == 0 {
                0.0
            } else {
                nanos as f64 / evaluations as f64 / 1_000_000.0
            },
            reloads_total: self.counters.reloads.load(Ordering::Relaxed),
            last_reload: *self.last_reload.load().as_ref(),
        }
    }
}

fn count_files(errors: &[PolicyValidationError]) -> usize {
    let mut files: Vec<&str> = errors.iter().map(|e| e.file.as_str()).collect();
    files.sort_unstable();
    files.dedup();
    files.len()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, std::sync::atomic::AtomicUsize};

    const RULES: &str = r#"
version: "1"
rules:
  - id: allow-browser
    priority: 100
    match: { resource: tool, resourceId: browser }
    effect: allow
  - id: deny-all
    priority: 10
    effect: deny
"#;

    fn engine_for(dir: &std::path::Path) -> PolicyEngine {
        PolicyEngine::new(PolicyEngineConfig {
            policies_dir: dir.to_path_buf(),
            ..Default::default()
        })
    }

    #[test]
    fn loads_and_evaluates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("base.yaml"), RULES).unwrap();
        let engine = engine_for(dir.path());

        let summary = engine.initialize().unwrap();
        assert_eq!(summary.documents, 1);
        assert_eq!(summary.rules, 2);

        let result = engine.evaluate(&SecurityRequest::new("tool", "browser", "invoke"));
        assert!(result.allowed);

        let stats = engine.stats();
        assert_eq!(stats.policies_loaded, 1);
        assert_eq!(stats.rules_active, 2);
        assert_eq!(stats.evaluations_total, 1);
        assert!(stats.last_reload.is_some());
    }

    #[test]
    fn empty_reload_swaps_to_default_deny() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("base.yaml");
        std::fs::write(&file, RULES).unwrap();
        let engine = engine_for(dir.path());
        engine.initialize().unwrap();
        assert!(engine.evaluate(&SecurityRequest::new("tool", "browser", "x")).allowed);

        std::fs::write(&file, "version: ''\n").unwrap();
        let summary = engine.reload().unwrap();
        assert_eq!(summary.documents, 0);
        assert_eq!(summary.invalid_files, 1);

        let result = engine.evaluate(&SecurityRequest::new("tool", "browser", "x"));
        assert!(!result.allowed);
        assert!(result.rule_id.is_none());
        assert_eq!(engine.validation_errors().len(), 1);
    }

    #[test]
    fn unreadable_directory_keeps_previous_rules() {
        let dir = tempfile::tempdir().unwrap();
        let policies = dir.path().join("policies");
        std::fs::create_dir(&policies).unwrap();
        std::fs::write(policies.join("base.yaml"), RULES).unwrap();

        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failures);
        let engine = engine_for(&policies).with_error_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        engine.initialize().unwrap();

        std::fs::remove_dir_all(&policies).unwrap();
        assert!(engine.reload().is_err());
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        let result = engine.evaluate(&SecurityRequest::new("tool", "browser", "x"));
        assert_eq!(result.rule_id.as_deref(), Some("allow-browser"));
        assert_eq!(engine.stats().reloads_total, 1);
    }

    #[test]
    fn reload_callback_reports_summary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("base.yaml"), RULES).unwrap();
        let rules = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&rules);
        let engine = engine_for(dir.path()).with_reload_callback(move |s| {
            seen.store(s.rules, Ordering::SeqCst);
        });
        engine.initialize().unwrap();
        assert_eq!(rules.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_evaluations_see_whole_tables() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("base.yaml");
        std::fs::write(&file, RULES).unwrap();
        let engine = Arc::new(engine_for(dir.path()));
        engine.initialize().unwrap();

        let reader = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let r = engine.evaluate(&SecurityRequest::new("tool", "browser", "x"));
                    // Either the full old table or the full new one.
                    assert!(matches!(
                        r.rule_id.as_deref(),
                        Some("allow-browser") | Some("browser-v2")
                    ));
                }
            })
        };

        for i in 0..20 {
            let id = if i % 2 == 0 { "browser-v2" } else { "allow-browser" };
            std::fs::write(&file, RULES.replace("allow-browser", id)).unwrap();
            engine.reload().unwrap();
        }
        reader.join().unwrap();
    }
}
