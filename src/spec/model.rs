//! The typed spec model (C2): `Workflow`, `TaskMapping`, `Task`, `TaskDefaults`.
//!
//! Grounded directly on `orchestra/specs/mistral/v2/tasks.py`'s `TaskSpec` /
//! `TaskMappingSpec` / `TaskDefaultsSpec`: duck-typed clause entries become
//! the `ClauseEntry` sum type (per spec §9's design note), and the
//! `join`/`with-items` "one of a primitive or a list" fields become
//! `JoinSpec`/`WithItems` enums instead of runtime type checks.

use super::schema::{self, ValidationError};
use crate::error::OrchestratorError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// `join: none | "all" | <positive integer>`.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum JoinSpec {
    #[default]
    None,
    All,
    Count(u32),
}

impl Serialize for JoinSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JoinSpec::None => serializer.serialize_none(),
            JoinSpec::All => serializer.serialize_str("all"),
            JoinSpec::Count(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for JoinSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(JoinSpec::from_value(Some(&value)))
    }
}

impl JoinSpec {
    fn from_value(v: Option<&Value>) -> Self {
        match v {
            None => JoinSpec::None,
            Some(Value::String(s)) if s == "all" => JoinSpec::All,
            Some(Value::Number(n)) if n.as_u64().is_some_and(|n| n > 0) => {
                JoinSpec::Count(n.as_u64().unwrap() as u32)
            }
            _ => JoinSpec::None,
        }
    }

    pub fn is_join(&self) -> bool {
        !matches!(self, JoinSpec::None)
    }
}

/// `with-items: <string> | [<string>, ...]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WithItems {
    Single(String),
    List(Vec<String>),
}

/// One entry in an `on-complete`/`on-success`/`on-error` clause: either a
/// bare task identifier, or a single-key `{identifier: criteria}` mapping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClauseEntry {
    Identifier(String),
    IdentifierWithCriteria(String, String),
}

impl ClauseEntry {
    pub fn target(&self) -> &str {
        match self {
            ClauseEntry::Identifier(id) => id,
            ClauseEntry::IdentifierWithCriteria(id, _) => id,
        }
    }

    pub fn criteria(&self) -> Option<&str> {
        match self {
            ClauseEntry::Identifier(_) => None,
            ClauseEntry::IdentifierWithCriteria(_, c) => Some(c),
        }
    }

    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::String(s) => Some(ClauseEntry::Identifier(s.clone())),
            Value::Object(map) if map.len() == 1 => {
                let (k, v) = map.iter().next().unwrap();
                v.as_str().map(|c| ClauseEntry::IdentifierWithCriteria(k.clone(), c.to_string()))
            }
            _ => None,
        }
    }
}

/// A parsed `on-*` clause, normalized to a list regardless of whether the
/// source document used the bare-string shorthand.
pub type Clause = Vec<ClauseEntry>;

fn clause_from_value(v: Option<&Value>) -> Clause {
    match v {
        None => Vec::new(),
        Some(Value::String(s)) => vec![ClauseEntry::Identifier(s.clone())],
        Some(Value::Array(items)) => items.iter().filter_map(ClauseEntry::from_value).collect(),
        Some(_) => Vec::new(),
    }
}

/// `retry: { count, delay-ms }` — re-entry policy on `failed`/`errored`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub count: u32,
    #[serde(rename = "delay-ms", default)]
    pub delay_ms: u64,
}

impl RetryPolicy {
    fn from_value(v: Option<&Value>) -> Option<Self> {
        let obj = v?.as_object()?;
        let count = obj.get("count")?.as_u64()? as u32;
        let delay_ms = obj.get("delay-ms").and_then(Value::as_u64).unwrap_or(0);
        Some(Self { count, delay_ms })
    }
}

/// Timing and concurrency policies shared by `Task` and `TaskDefaults`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Policies {
    pub concurrency: Option<u32>,
    #[serde(rename = "wait-before")]
    pub wait_before_ms: Option<u64>,
    #[serde(rename = "wait-after")]
    pub wait_after_ms: Option<u64>,
    #[serde(rename = "pause-before")]
    pub pause_before: Option<bool>,
    pub timeout_ms: Option<u64>,
}

impl Policies {
    fn from_obj(obj: &serde_json::Map<String, Value>) -> Self {
        Self {
            concurrency: obj.get("concurrency").and_then(Value::as_u64).map(|n| n as u32),
            wait_before_ms: obj.get("wait-before").and_then(Value::as_u64),
            wait_after_ms: obj.get("wait-after").and_then(Value::as_u64),
            pause_before: obj.get("pause-before").and_then(Value::as_bool),
            timeout_ms: obj.get("timeout").and_then(Value::as_u64),
        }
    }
}

/// `action` and `workflow` are mutually exclusive; at most one is present.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Invocation {
    Action(String),
    Workflow(String),
    None,
}

/// A single task spec.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub join: JoinSpec,
    pub with_items: Option<WithItems>,
    pub invocation: Invocation,
    pub input: BTreeMap<String, Value>,
    pub publish: BTreeMap<String, String>,
    pub retry: Option<RetryPolicy>,
    pub policies: Policies,
    pub on_complete: Clause,
    pub on_success: Clause,
    pub on_error: Clause,
}

impl Task {
    /// Parse a single task document. Schema violations are reported
    /// separately via [`schema::validate`]; this constructor is best-effort
    /// so an invalid task spec is still represented (spec §7: "the spec
    /// object is still constructed but marked invalid").
    pub fn from_value(doc: &Value) -> Self {
        let empty = serde_json::Map::new();
        let obj = doc.as_object().unwrap_or(&empty);

        let invocation = match (obj.get("action"), obj.get("workflow")) {
            (Some(Value::String(a)), _) => Invocation::Action(a.clone()),
            (None, Some(Value::String(w))) => Invocation::Workflow(w.clone()),
            _ => Invocation::None,
        };

        let input = obj
            .get("input")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        let publish = obj
            .get("publish")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let with_items = obj.get("with-items").map(|v| match v {
            Value::Array(items) => WithItems::List(
                items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect(),
            ),
            Value::String(s) => WithItems::Single(s.clone()),
            _ => WithItems::List(Vec::new()),
        });

        Self {
            join: JoinSpec::from_value(obj.get("join")),
            with_items,
            invocation,
            input,
            publish,
            retry: RetryPolicy::from_value(obj.get("retry")),
            policies: Policies::from_obj(obj),
            on_complete: clause_from_value(obj.get("on-complete")),
            on_success: clause_from_value(obj.get("on-success")),
            on_error: clause_from_value(obj.get("on-error")),
        }
    }

    pub fn has_join(&self) -> bool {
        self.join.is_join()
    }

    /// Names of variables this task may ever publish — used by
    /// `inspect_context`. Unconditional over the `publish` map regardless of
    /// criteria, since context *visibility* analysis is more permissive than
    /// runtime gating.
    pub fn published_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.publish.keys().cloned().collect();
        names.sort();
        names
    }
}

/// `task-defaults`: policies and clauses inherited by every task unless
/// overridden.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDefaults {
    pub policies: Policies,
    pub retry: Option<RetryPolicy>,
    pub on_complete: Clause,
    pub on_success: Clause,
    pub on_error: Clause,
}

impl TaskDefaults {
    pub fn from_value(doc: &Value) -> Self {
        let empty = serde_json::Map::new();
        let obj = doc.as_object().unwrap_or(&empty);
        Self {
            policies: Policies::from_obj(obj),
            retry: RetryPolicy::from_value(obj.get("retry")),
            on_complete: clause_from_value(obj.get("on-complete")),
            on_success: clause_from_value(obj.get("on-success")),
            on_error: clause_from_value(obj.get("on-error")),
        }
    }
}

/// A mapping from task id to task spec (minimum 1 entry, enforced by
/// `spec::schema`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMapping(pub BTreeMap<String, Task>);

impl TaskMapping {
    pub fn get(&self, name: &str) -> Option<&Task> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The full workflow spec: tasks plus optional defaults, input, vars, output.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub tasks: TaskMapping,
    pub task_defaults: Option<TaskDefaults>,
    pub input: BTreeMap<String, Value>,
    pub vars: BTreeMap<String, Value>,
    pub output: BTreeMap<String, Value>,
}

impl Workflow {
    /// Build a `Workflow` from a raw document, alongside every schema
    /// violation found (spec §6/§7: errors are a flat list, the object is
    /// still constructed).
    pub fn from_value(doc: &Value) -> (Self, Vec<ValidationError>) {
        let mut errors = schema::validate(doc, &schema::workflow_schema(), "workflow", "schema");

        let empty = serde_json::Map::new();
        let obj = doc.as_object().unwrap_or(&empty);
        let tasks_doc = obj.get("tasks").cloned().unwrap_or(Value::Object(Default::default()));

        let mut tasks = BTreeMap::new();
        if let Some(task_objs) = tasks_doc.as_object() {
            for (name, task_doc) in task_objs {
                errors.extend(schema::check_action_xor_workflow(
                    task_doc,
                    &format!("workflow.tasks.{name}"),
                ));
                tasks.insert(name.clone(), Task::from_value(task_doc));
            }
        }

        let task_defaults = obj.get("task-defaults").map(TaskDefaults::from_value);
        let input = obj_to_map(obj.get("input"));
        let vars = obj_to_map(obj.get("vars"));
        let output = obj_to_map(obj.get("output"));

        (
            Workflow {
                tasks: TaskMapping(tasks),
                task_defaults,
                input,
                vars,
                output,
            },
            errors,
        )
    }

    /// Parse a JSON-encoded spec document, then build as in [`Self::from_value`].
    pub fn from_json_str(s: &str) -> Result<(Self, Vec<ValidationError>), OrchestratorError> {
        let doc: Value = serde_json::from_str(s).map_err(|e| OrchestratorError::DocumentParse(e.to_string()))?;
        Ok(Self::from_value(&doc))
    }

    /// Parse a YAML-encoded spec document, then build as in [`Self::from_value`].
    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(s: &str) -> Result<(Self, Vec<ValidationError>), OrchestratorError> {
        let doc: Value = serde_yaml::from_str(s).map_err(|e| OrchestratorError::DocumentParse(e.to_string()))?;
        Ok(Self::from_value(&doc))
    }
}

fn obj_to_map(v: Option<&Value>) -> BTreeMap<String, Value> {
    v.and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_join_all_and_count() {
        assert_eq!(JoinSpec::from_value(Some(&json!("all"))), JoinSpec::All);
        assert_eq!(JoinSpec::from_value(Some(&json!(2))), JoinSpec::Count(2));
        assert_eq!(JoinSpec::from_value(None), JoinSpec::None);
    }

    #[test]
    fn clause_normalizes_bare_string_and_list() {
        assert_eq!(
            clause_from_value(Some(&json!("t2"))),
            vec![ClauseEntry::Identifier("t2".to_string())]
        );
        let parsed = clause_from_value(Some(&json!(["t2", {"t3": "<% true %>"}])));
        assert_eq!(
            parsed,
            vec![
                ClauseEntry::Identifier("t2".to_string()),
                ClauseEntry::IdentifierWithCriteria("t3".to_string(), "<% true %>".to_string()),
            ]
        );
    }

    #[test]
    fn action_and_workflow_mutually_exclusive_detected_at_workflow_level() {
        let doc = json!({
            "tasks": {
                "t1": {"action": "a", "workflow": "w"}
            }
        });
        let (_, errors) = Workflow::from_value(&doc);
        assert!(errors.iter().any(|e| e.message.contains("mutually exclusive")));
    }

    #[test]
    fn minimal_workflow_parses_cleanly() {
        let doc = json!({
            "tasks": {
                "t1": {"on-success": "t2"},
                "t2": {}
            }
        });
        let (wf, errors) = Workflow::from_value(&doc);
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        assert_eq!(wf.tasks.len(), 2);
        assert_eq!(
            wf.tasks.get("t1").unwrap().on_success,
            vec![ClauseEntry::Identifier("t2".to_string())]
        );
    }

    #[test]
    fn from_json_str_parses_and_validates() {
        let (wf, errors) = Workflow::from_json_str(r#"{"tasks": {"t1": {}}}"#).unwrap();
        assert!(errors.is_empty());
        assert_eq!(wf.tasks.len(), 1);

        let err = Workflow::from_json_str("not json").unwrap_err();
        assert!(matches!(err, OrchestratorError::DocumentParse(_)));
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn from_yaml_str_parses_and_validates() {
        let yaml = "tasks:\n  t1:\n    on-success: t2\n  t2: {}\n";
        let (wf, errors) = Workflow::from_yaml_str(yaml).unwrap();
        assert!(errors.is_empty());
        assert_eq!(wf.tasks.len(), 2);
    }
}
