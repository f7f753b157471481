//! Compiled rule table and the synchronous matcher.

use std::{borrow::Cow, collections::HashMap, sync::Arc, time::Instant};

use {
    arc_swap::ArcSwap,
    regex::Regex,
    serde_json::Value,
    tracing::warn,
};

use crate::{
    loader::LoadedDocument,
    types::{ConditionOperator, Effect, PolicyRule, RuleMatch, SecurityRequest, SecurityResult},
};

// ── Compiled form ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct CompiledRule {
    id: String,
    matcher: RuleMatch,
    conditions: Vec<CompiledCondition>,
    effect: Effect,
    reason: Option<String>,
}

#[derive(Debug)]
struct CompiledCondition {
    field: FieldRef,
    operator: ConditionOperator,
    value: Value,
    pattern: Option<Regex>,
}

/// Where a condition reads its left-hand side from.
#[derive(Debug)]
enum FieldRef {
    RequestId,
    UserId,
    SessionId,
    SecurityMode,
    Action,
    ResourceType,
    ResourceId,
    Metadata(Vec<String>),
}

impl FieldRef {
    fn parse(field: &str) -> Self {
        match field {
            "requestId" => Self::RequestId,
            "userId" => Self::UserId,
            "sessionId" => Self::SessionId,
            "securityMode" => Self::SecurityMode,
            "action" => Self::Action,
            "resource.type" => Self::ResourceType,
            "resource.id" => Self::ResourceId,
            other => {
                let path = other.strip_prefix("metadata.").unwrap_or(other);
                Self::Metadata(path.split('.').map(String::from).collect())
            },
        }
    }

    fn resolve<'a>(&self, req: &'a SecurityRequest) -> Option<Operand<'a>> {
        let text = |s: &'a str| Some(Operand::Text(s));
        match self {
            Self::RequestId => text(&req.request_id),
            Self::UserId => text(&req.user_id),
            Self::SessionId => text(&req.session_id),
            Self::SecurityMode => text(req.security_mode.as_str()),
            Self::Action => text(&req.action),
            Self::ResourceType => text(&req.resource.resource_type),
            Self::ResourceId => text(&req.resource.id),
            Self::Metadata(path) => path
                .iter()
                .try_fold(&req.metadata, |v, key| v.get(key.as_str()))
                .filter(|v| !v.is_null())
                .map(Operand::Json),
        }
    }
}

/// Borrowed left-hand side of a condition.
enum Operand<'a> {
    Text(&'a str),
    Json(&'a Value),
}

impl Operand<'_> {
    fn text(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Text(s) => Some(Cow::Borrowed(*s)),
            Self::Json(v) => scalar_text(v),
        }
    }

    fn equals(&self, expected: &Value) -> bool {
        match self {
            Self::Json(v) if *v == expected => true,
            _ => match (self.text(), scalar_text(expected)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    fn contains(&self, needle: &Value) -> bool {
        match self {
            Self::Json(Value::Array(items)) => items
                .iter()
                .any(|item| Operand::Json(item).equals(needle)),
            _ => match (self.text(), scalar_text(needle)) {
                (Some(hay), Some(needle)) => hay.contains(needle.as_ref()),
                _ => false,
            },
        }
    }
}

fn scalar_text(v: &Value) -> Option<Cow<'_, str>> {
    match v {
        Value::String(s) => Some(Cow::Borrowed(s)),
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        Value::Bool(b) => Some(Cow::Borrowed(if *b { "true" } else { "false" })),
        _ => None,
    }
}

impl CompiledCondition {
    fn holds(&self, req: &SecurityRequest) -> bool {
        // A missing field never satisfies a condition, whatever the operator.
        let Some(lhs) = self.field.resolve(req) else {
            return false;
        };
        let in_list = || {
            self.value
                .as_array()
                .is_some_and(|items| items.iter().any(|item| lhs.equals(item)))
        };

        match self.operator {
            ConditionOperator::Equals => lhs.equals(&self.value),
            ConditionOperator::NotEquals => !lhs.equals(&self.value),
            ConditionOperator::In => in_list(),
            ConditionOperator::NotIn => !in_list(),
            ConditionOperator::Contains => lhs.contains(&self.value),
            ConditionOperator::StartsWith => {
                compare_text(&lhs, &self.value, |a: &str, b: &str| a.starts_with(b))
            },
            ConditionOperator::EndsWith => {
                compare_text(&lhs, &self.value, |a: &str, b: &str| a.ends_with(b))
            },
            ConditionOperator::Matches => match (&self.pattern, lhs.text()) {
                (Some(re), Some(text)) => re.is_match(&text),
                _ => false,
            },
        }
    }
}

fn compare_text(lhs: &Operand<'_>, value: &Value, op: fn(&str, &str) -> bool) -> bool {
    match (lhs.text(), value.as_str()) {
        (Some(a), Some(b)) => op(a.as_ref(), b),
        _ => false,
    }
}

impl CompiledRule {
    fn applies(&self, req: &SecurityRequest) -> bool {
        self.matcher.matches(req) && self.conditions.iter().all(|c| c.holds(req))
    }
}

// ── Rule table ──────────────────────────────────────────────────────────────

/// Immutable, priority-ordered rule set. Replaced wholesale on reload.
#[derive(Debug, Default)]
pub struct RuleTable {
    /// Sorted by priority descending, then load order.
    rules: Vec<CompiledRule>,
    /// Positions (ascending) of rules pinned to a resource type.
    by_resource: HashMap<String, Vec<usize>>,
    /// Positions (ascending) of rules with no resource selector.
    any_resource: Vec<usize>,
    documents: usize,
}

impl RuleTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile documents in load order. Ties in priority keep that order.
    pub fn compile(documents: &[LoadedDocument]) -> Self {
        let mut ordered: Vec<(i64, CompiledRule)> = Vec::new();
        for loaded in documents {
            for rule in &loaded.document.rules {
                match compile_rule(rule) {
                    Ok(compiled) => ordered.push((rule.priority, compiled)),
                    Err(e) => warn!(
                        file = %loaded.file.display(),
                        rule_id = %rule.id,
                        error = %e,
                        "skipping uncompilable rule"
                    ),
                }
            }
        }
        // Stable sort: equal priorities stay in load order.
        ordered.sort_by(|a, b| b.0.cmp(&a.0));

        let rules: Vec<CompiledRule> = ordered.into_iter().map(|(_, r)| r).collect();
        let mut by_resource: HashMap<String, Vec<usize>> = HashMap::new();
        let mut any_resource = Vec::new();
        for (pos, rule) in rules.iter().enumerate() {
            match &rule.matcher.resource {
                None => any_resource.push(pos),
                Some(selector) => {
                    for ty in selector.values() {
                        let slots = by_resource.entry(ty.clone()).or_default();
                        if slots.last() != Some(&pos) {
                            slots.push(pos);
                        }
                    }
                },
            }
        }

        Self {
            rules,
            by_resource,
            any_resource,
            documents: documents.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn document_count(&self) -> usize {
        self.documents
    }

    /// Rule ids in evaluation order.
    pub fn rule_ids(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.id.as_str())
    }

    /// First applicable rule in priority order.
    fn find(&self, req: &SecurityRequest) -> Option<&CompiledRule> {
        let pinned = self
            .by_resource
            .get(&req.resource.resource_type)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let wildcard = self.any_resource.as_slice();

        // Merge two ascending position lists, stopping at the first hit.
        let (mut i, mut j) = (0, 0);
        loop {
            let pos = match (pinned.get(i), wildcard.get(j)) {
                (Some(&a), Some(&b)) if a < b => {
                    i += 1;
                    a
                },
                (_, Some(&b)) => {
                    j += 1;
                    b
                },
                (Some(&a), None) => {
                    i += 1;
                    a
                },
                (None, None) => return None,
            };
            let rule = &self.rules[pos];
            if rule.applies(req) {
                return Some(rule);
            }
        }
    }
}

fn compile_rule(rule: &PolicyRule) -> Result<CompiledRule, regex::Error> {
    let conditions = rule
        .conditions
        .iter()
        .map(|c| {
            let pattern = match (c.operator, c.value.as_str()) {
                (ConditionOperator::Matches, Some(p)) => Some(Regex::new(p)?),
                _ => None,
            };
            Ok::<_, regex::Error>(CompiledCondition {
                field: FieldRef::parse(&c.field),
                operator: c.operator,
                value: c.value.clone(),
                pattern,
            })
        })
        .collect::<Result<Vec<_>, regex::Error>>()?;

    Ok(CompiledRule {
        id: rule.id.clone(),
        matcher: rule.matcher.clone(),
        conditions,
        effect: rule.effect,
        reason: rule.reason.clone(),
    })
}

// ── Evaluator ───────────────────────────────────────────────────────────────

/// Matches requests against the active [`RuleTable`].
///
/// The table lives behind an [`ArcSwap`]: each evaluation works on one
/// snapshot, and [`PolicyEvaluator::replace`] is a single pointer store, so no
/// evaluation can observe a half-installed rule set.
pub struct PolicyEvaluator {
    table: ArcSwap<RuleTable>,
    default_effect: Effect,
}

impl PolicyEvaluator {
    pub fn new(default_effect: Effect) -> Self {
        Self {
            table: ArcSwap::from_pointee(RuleTable::empty()),
            default_effect,
        }
    }

    pub fn default_effect(&self) -> Effect {
        self.default_effect
    }

    pub fn replace(&self, table: RuleTable) {
        self.table.store(Arc::new(table));
    }

    pub fn table(&self) -> Arc<RuleTable> {
        self.table.load_full()
    }

    pub fn evaluate(&self, req: &SecurityRequest) -> SecurityResult {
        let started = Instant::now();
        let table = self.table.load();

        let (effect, rule_id, reason) = match table.find(req) {
            Some(rule) => (rule.effect, Some(rule.id.clone()), rule.reason.clone()),
            None => (
                self.default_effect,
                None,
                Some("no matching policy rule".to_string()),
            ),
        };

        SecurityResult {
            allowed: effect.is_allow(),
            effect,
            rule_id,
            reason,
            evaluation_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }
}
