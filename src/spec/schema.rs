//! Plain-data schema declarations and a pure validator.
//!
//! No reflection: a `Schema` is built once as ordinary data (see
//! [`task_schema`] / [`workflow_schema`]) and [`validate`] is a recursive
//! walk over a schema plus a `serde_json::Value` document. This is the
//! crate's own version of the teacher crate's `compiler::verifier` pass —
//! same shape (accumulate a `Vec` of errors, never stop at the first one),
//! applied to spec documents instead of a BPMN IR.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One schema-validation failure, matching the shape exposed at the crate
/// boundary (spec §6).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub message: String,
    pub spec_path: String,
    pub schema_path: String,
}

impl ValidationError {
    fn new(message: impl Into<String>, spec_path: &str, schema_path: &str) -> Self {
        Self {
            message: message.into(),
            spec_path: spec_path.to_string(),
            schema_path: schema_path.to_string(),
        }
    }
}

/// A property's schema plus whether it's required.
#[derive(Clone, Debug)]
pub struct Property {
    pub name: &'static str,
    pub schema: Schema,
    pub required: bool,
}

/// Plain-data schema node. Deliberately small: just enough to validate the
/// workflow/task document shapes this crate cares about.
#[derive(Clone, Debug)]
pub enum Schema {
    NonEmptyString,
    PositiveInteger,
    Boolean,
    AnyValue,
    /// One of a fixed set of literal strings.
    Enum(&'static [&'static str]),
    /// Matches if any of the alternatives validate cleanly.
    OneOf(Vec<Schema>),
    Object {
        properties: Vec<Property>,
        additional_properties: bool,
    },
    /// A mapping whose keys must match `^\w+$` and whose values all
    /// validate against `value_schema` — used for `TaskMapping`.
    PatternObject { value_schema: Box<Schema> },
    List(Box<Schema>),
}

/// Walk `doc` against `schema`, accumulating every violation instead of
/// stopping at the first one (spec §7: "Schema errors: accumulated across
/// the whole spec").
pub fn validate(doc: &Value, schema: &Schema, spec_path: &str, schema_path: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    validate_into(doc, schema, spec_path, schema_path, &mut errors);
    errors
}

fn validate_into(
    doc: &Value,
    schema: &Schema,
    spec_path: &str,
    schema_path: &str,
    errors: &mut Vec<ValidationError>,
) {
    match schema {
        Schema::AnyValue => {}
        Schema::NonEmptyString => match doc.as_str() {
            Some(s) if !s.is_empty() => {}
            Some(_) => errors.push(ValidationError::new(
                "expected a non-empty string",
                spec_path,
                schema_path,
            )),
            None => errors.push(ValidationError::new(
                "expected a string",
                spec_path,
                schema_path,
            )),
        },
        Schema::PositiveInteger => match doc.as_u64() {
            Some(n) if n > 0 => {}
            _ => errors.push(ValidationError::new(
                "expected a positive integer",
                spec_path,
                schema_path,
            )),
        },
        Schema::Boolean => {
            if !doc.is_boolean() {
                errors.push(ValidationError::new("expected a boolean", spec_path, schema_path));
            }
        }
        Schema::Enum(variants) => match doc.as_str() {
            Some(s) if variants.contains(&s) => {}
            _ => errors.push(ValidationError::new(
                format!("expected one of {variants:?}"),
                spec_path,
                schema_path,
            )),
        },
        Schema::OneOf(alts) => {
            let all_fail = alts
                .iter()
                .all(|alt| !validate(doc, alt, spec_path, schema_path).is_empty());
            if all_fail {
                errors.push(ValidationError::new(
                    "value did not match any allowed schema",
                    spec_path,
                    schema_path,
                ));
            }
        }
        Schema::Object {
            properties,
            additional_properties,
        } => {
            let Some(obj) = doc.as_object() else {
                errors.push(ValidationError::new("expected an object", spec_path, schema_path));
                return;
            };
            for prop in properties {
                match obj.get(prop.name) {
                    Some(value) => validate_into(
                        value,
                        &prop.schema,
                        &format!("{spec_path}.{}", prop.name),
                        &format!("{schema_path}.properties.{}", prop.name),
                        errors,
                    ),
                    None if prop.required => errors.push(ValidationError::new(
                        format!("missing required property '{}'", prop.name),
                        spec_path,
                        schema_path,
                    )),
                    None => {}
                }
            }
            if !additional_properties {
                let known: Vec<&str> = properties.iter().map(|p| p.name).collect();
                for key in obj.keys() {
                    if !known.contains(&key.as_str()) {
                        errors.push(ValidationError::new(
                            format!("unexpected property '{key}'"),
                            spec_path,
                            schema_path,
                        ));
                    }
                }
            }
        }
        Schema::PatternObject { value_schema } => {
            let Some(obj) = doc.as_object() else {
                errors.push(ValidationError::new("expected an object", spec_path, schema_path));
                return;
            };
            if obj.is_empty() {
                errors.push(ValidationError::new(
                    "expected at least one entry",
                    spec_path,
                    schema_path,
                ));
            }
            for (key, value) in obj {
                if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
                    errors.push(ValidationError::new(
                        format!("key '{key}' is not a valid identifier"),
                        spec_path,
                        schema_path,
                    ));
                    continue;
                }
                validate_into(
                    value,
                    value_schema,
                    &format!("{spec_path}.{key}"),
                    &format!("{schema_path}.patternProperties"),
                    errors,
                );
            }
        }
        Schema::List(item_schema) => {
            let Some(items) = doc.as_array() else {
                errors.push(ValidationError::new("expected an array", spec_path, schema_path));
                return;
            };
            for (i, item) in items.iter().enumerate() {
                validate_into(
                    item,
                    item_schema,
                    &format!("{spec_path}[{i}]"),
                    &format!("{schema_path}.items"),
                    errors,
                );
            }
        }
    }
}

/// Schema for a single `on-complete`/`on-success`/`on-error` clause: either
/// a bare task name, or a list of task names / `{name: criteria}` singletons.
pub fn on_clause_schema() -> Schema {
    Schema::OneOf(vec![
        Schema::NonEmptyString,
        Schema::List(Box::new(Schema::OneOf(vec![
            Schema::NonEmptyString,
            Schema::PatternObject {
                value_schema: Box::new(Schema::NonEmptyString),
            },
        ]))),
    ])
}

pub fn join_schema() -> Schema {
    Schema::OneOf(vec![Schema::Enum(&["all"]), Schema::PositiveInteger])
}

pub fn task_schema() -> Schema {
    Schema::Object {
        properties: vec![
            Property { name: "join", schema: join_schema(), required: false },
            Property {
                name: "with-items",
                schema: Schema::OneOf(vec![
                    Schema::NonEmptyString,
                    Schema::List(Box::new(Schema::NonEmptyString)),
                ]),
                required: false,
            },
            Property { name: "concurrency", schema: Schema::PositiveInteger, required: false },
            Property { name: "action", schema: Schema::NonEmptyString, required: false },
            Property { name: "workflow", schema: Schema::NonEmptyString, required: false },
            Property { name: "input", schema: Schema::AnyValue, required: false },
            Property { name: "publish", schema: Schema::AnyValue, required: false },
            Property { name: "retry", schema: Schema::AnyValue, required: false },
            Property { name: "wait-before", schema: Schema::PositiveInteger, required: false },
            Property { name: "wait-after", schema: Schema::PositiveInteger, required: false },
            Property { name: "pause-before", schema: Schema::Boolean, required: false },
            Property { name: "timeout", schema: Schema::PositiveInteger, required: false },
            Property { name: "on-complete", schema: on_clause_schema(), required: false },
            Property { name: "on-success", schema: on_clause_schema(), required: false },
            Property { name: "on-error", schema: on_clause_schema(), required: false },
        ],
        additional_properties: false,
    }
}

pub fn task_mapping_schema() -> Schema {
    Schema::PatternObject {
        value_schema: Box::new(task_schema()),
    }
}

pub fn workflow_schema() -> Schema {
    Schema::Object {
        properties: vec![
            Property { name: "tasks", schema: task_mapping_schema(), required: true },
            Property { name: "task-defaults", schema: Schema::AnyValue, required: false },
            Property { name: "input", schema: Schema::AnyValue, required: false },
            Property { name: "vars", schema: Schema::AnyValue, required: false },
            Property { name: "output", schema: Schema::AnyValue, required: false },
        ],
        additional_properties: false,
    }
}

/// `action` and `workflow` are mutually exclusive on a task spec — the one
/// rule the base schema can't express declaratively (mirrors `TaskSpec`'s
/// `anyOf`/`not` clause in `orchestra`).
pub fn check_action_xor_workflow(doc: &Value, spec_path: &str) -> Vec<ValidationError> {
    let Some(obj) = doc.as_object() else {
        return Vec::new();
    };
    if obj.contains_key("action") && obj.contains_key("workflow") {
        vec![ValidationError::new(
            "'action' and 'workflow' are mutually exclusive",
            spec_path,
            "properties.anyOf",
        )]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_schema_rejects_unknown_property() {
        let doc = json!({"on-success": "t2", "bogus": 1});
        let errors = validate(&doc, &task_schema(), "wf.t1", "properties.t1");
        assert!(errors.iter().any(|e| e.message.contains("bogus")));
    }

    #[test]
    fn on_clause_accepts_bare_string_or_list() {
        let schema = on_clause_schema();
        assert!(validate(&json!("t2"), &schema, "p", "s").is_empty());
        assert!(validate(&json!(["t2", {"t3": "<% true %>"}]), &schema, "p", "s").is_empty());
        assert!(!validate(&json!(42), &schema, "p", "s").is_empty());
    }

    #[test]
    fn action_and_workflow_are_mutually_exclusive() {
        let doc = json!({"action": "a", "workflow": "w"});
        assert_eq!(check_action_xor_workflow(&doc, "wf.t1").len(), 1);
    }

    #[test]
    fn task_mapping_requires_at_least_one_entry() {
        let errors = validate(&json!({}), &task_mapping_schema(), "wf.tasks", "properties.tasks");
        assert!(errors.iter().any(|e| e.message.contains("at least one")));
    }
}
