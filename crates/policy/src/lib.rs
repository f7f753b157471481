//! Rule-based authorization for the gateway.
//!
//! Policy documents are YAML files in a directory. Each file is validated on
//! its own; valid files are compiled into a [`evaluator::RuleTable`] that is
//! swapped in atomically on every reload. Evaluation is synchronous and never
//! touches the filesystem.

pub mod engine;
pub mod error;
pub mod evaluator;
pub mod loader;
pub mod types;
#[cfg(feature = "file-watcher")]
pub mod watcher;

pub use {
    engine::{PolicyEngine, PolicyEngineConfig, PolicyStats, ReloadSummary},
    error::{PolicyLoadError, PolicyValidationError},
    evaluator::{PolicyEvaluator, RuleTable},
    loader::{LoadReport, LoadedDocument, PolicyLoader},
    types::{
        Condition, ConditionOperator, Effect, MatchValue, PolicyDocument, PolicyMetadata,
        PolicyRule, Resource, RuleMatch, SecurityRequest, SecurityResult,
    },
};

#[cfg(feature = "file-watcher")]
pub use watcher::PolicyWatcher;
