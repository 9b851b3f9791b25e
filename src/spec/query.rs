//! Structural queries over the spec model (C2): start tasks, next/prev
//! tasks, join/split classification, cycle detection, and context
//! inspection/finalization.
//!
//! Ported from `orchestra/specs/mistral/v2/tasks.py::TaskMappingSpec` and
//! `TaskSpec.finalize_context`, with the BFS queue replaced by a
//! `std::collections::VecDeque` and the Python `six.iteritems` dance
//! dropped — everything else (iteration order, sort keys, the `__`-prefix
//! scrub) is kept literally.

use super::model::{ClauseEntry, Task, Workflow};
use crate::context::Context;
use crate::error::{OrchestratorError, Result};
use crate::expr::ExpressionEvaluator;
use std::collections::{BTreeMap, HashSet, VecDeque};

/// One outgoing or incoming transition as seen from the spec model:
/// `(other_task, criteria, clause_name)`.
pub type SpecTransition = (String, Option<String>, &'static str);

const CLAUSE_ORDER: [&str; 3] = ["on-complete", "on-error", "on-success"];

fn clause_entries<'a>(task: &'a Task, clause: &str) -> &'a [ClauseEntry] {
    match clause {
        "on-complete" => &task.on_complete,
        "on-success" => &task.on_success,
        "on-error" => &task.on_error,
        _ => &[],
    }
}

impl Workflow {
    pub fn get_task(&self, name: &str) -> Result<&Task> {
        self.tasks
            .get(name)
            .ok_or_else(|| OrchestratorError::InvalidTask(name.to_string()))
    }

    /// Outgoing transitions for `name` across `conditions` (defaulting to
    /// `on-complete, on-error, on-success` in that order), sorted by
    /// destination task id.
    pub fn get_next_tasks(&self, name: &str, conditions: Option<&[&str]>) -> Result<Vec<SpecTransition>> {
        let task = self.get_task(name)?;
        let clauses = conditions.unwrap_or(&CLAUSE_ORDER);

        let mut out = Vec::new();
        for &clause in clauses {
            let clause_name: &'static str = CLAUSE_ORDER
                .iter()
                .find(|c| **c == clause)
                .copied()
                .unwrap_or("on-complete");
            for entry in clause_entries(task, clause) {
                out.push((
                    entry.target().to_string(),
                    entry.criteria().map(str::to_string),
                    clause_name,
                ));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Incoming transitions for `name`: a full scan over every task's
    /// outgoing transitions, sorted by source task id.
    pub fn get_prev_tasks(&self, name: &str, conditions: Option<&[&str]>) -> Vec<SpecTransition> {
        let mut out = Vec::new();
        for task_name in self.tasks.names() {
            if let Ok(next) = self.get_next_tasks(task_name, conditions) {
                for (dst, criteria, clause) in next {
                    if dst == name {
                        out.push((task_name.clone(), criteria, clause));
                    }
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Tasks with no predecessors, as `(name, None, None)` sorted by name.
    pub fn get_start_tasks(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .tasks
            .names()
            .filter(|name| self.get_prev_tasks(name, None).is_empty())
            .cloned()
            .collect();
        out.sort();
        out
    }

    pub fn is_join_task(&self, name: &str) -> bool {
        self.tasks.get(name).map(Task::has_join).unwrap_or(false)
    }

    pub fn is_split_task(&self, name: &str) -> bool {
        !self.is_join_task(name) && self.get_prev_tasks(name, None).len() > 1
    }

    /// True iff `name` is reachable from itself along `on-*` transitions.
    pub fn in_cycle(&self, name: &str) -> bool {
        let mut traversed: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        let Ok(next) = self.get_next_tasks(name, None) else {
            return false;
        };
        for (dst, ..) in next {
            queue.push_back(dst);
        }

        while let Some(next_name) = queue.pop_front() {
            if next_name == name {
                return true;
            }
            if traversed.contains(&next_name) {
                return false;
            }
            if let Ok(next) = self.get_next_tasks(&next_name, None) {
                for (dst, ..) in next {
                    queue.push_back(dst);
                }
            }
            traversed.insert(next_name);
        }

        false
    }

    pub fn has_cycles(&self) -> bool {
        self.tasks.names().any(|name| self.in_cycle(name))
    }

    /// BFS from start tasks computing, per task, the set of variable names
    /// visible when it runs, plus the running union (`rolling_ctx`).
    pub fn inspect_context(&self, parent_ctx: &[String]) -> (Vec<String>, Vec<String>) {
        let mut ctxs: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut errors: Vec<String> = Vec::new();
        let mut rolling_ctx = dedupe(parent_ctx);

        let mut queue: VecDeque<(String, Option<Vec<String>>)> = VecDeque::new();
        for start in self.get_start_tasks() {
            queue.push_back((start, Some(rolling_ctx.clone())));
        }

        while let Some((task_name, ctx_in)) = queue.pop_front() {
            let task_ctx = ctx_in.unwrap_or_else(|| ctxs.get(&task_name).cloned().unwrap_or_default());

            let Ok(task) = self.get_task(&task_name) else {
                continue;
            };

            let produced = task.published_names();
            let ctx_out = dedupe(&Context::union_names(&task_ctx, &produced));
            rolling_ctx = dedupe(&Context::union_names(&rolling_ctx, &ctx_out));

            let Ok(next) = self.get_next_tasks(&task_name, None) else {
                continue;
            };
            for (dst, ..) in next {
                if self.is_join_task(&dst) {
                    let entry = ctxs.entry(dst.clone()).or_default();
                    *entry = dedupe(&Context::union_names(entry, &ctx_out));
                    queue.push_back((dst, None));
                } else {
                    queue.push_back((dst, Some(ctx_out.clone())));
                }
            }
        }

        errors.dedup();
        (errors, rolling_ctx)
    }
}

fn dedupe(names: &[String]) -> Vec<String> {
    let mut out = names.to_vec();
    out.sort();
    out.dedup();
    out
}

/// Matches `finalize_context`'s literal publish-gating criterion. Only this
/// exact form — not any semantically-equivalent expression — triggers
/// publishing (spec §9 Open Question).
pub fn is_publish_gate(criteria: &str, task_name: &str) -> bool {
    criteria.trim() == format!("<% task_state({task_name}) in ['succeeded'] %>")
}

impl Task {
    /// Evaluate `publish` against `in_ctx` if `criteria` is the literal
    /// publish-gating form for `source_task`; otherwise return `in_ctx`
    /// unchanged. Evaluation errors are collected but never abort remaining
    /// evaluations (spec §7).
    pub fn finalize_context(
        &self,
        source_task: &str,
        criteria: Option<&str>,
        in_ctx: &Context,
        evaluator: &dyn ExpressionEvaluator,
    ) -> (Context, Vec<String>) {
        let Some(criteria) = criteria else {
            return (in_ctx.clone(), Vec::new());
        };
        if !is_publish_gate(criteria, source_task) {
            return (in_ctx.clone(), Vec::new());
        }

        let mut additions = BTreeMap::new();
        let mut errors = Vec::new();
        for (var_name, var_expr) in &self.publish {
            match evaluator.evaluate(var_expr, in_ctx) {
                Ok(value) => {
                    additions.insert(var_name.clone(), value);
                }
                Err(e) => errors.push(e.to_string()),
            }
        }

        (in_ctx.merged_and_stripped(&additions), errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::LiteralEvaluator;
    use serde_json::json;

    fn linear_chain() -> Workflow {
        let doc = json!({
            "tasks": {
                "t1": {"on-success": "t2"},
                "t2": {"on-success": "t3"},
                "t3": {}
            }
        });
        Workflow::from_value(&doc).0
    }

    #[test]
    fn get_start_tasks_is_t1() {
        let wf = linear_chain();
        assert_eq!(wf.get_start_tasks(), vec!["t1".to_string()]);
    }

    #[test]
    fn fan_out_is_sorted_by_destination() {
        let doc = json!({
            "tasks": {
                "t1": {"on-success": ["t9", "t2", "t7", "t4"]},
                "t2": {}, "t4": {}, "t7": {}, "t9": {}
            }
        });
        let (wf, _) = Workflow::from_value(&doc);
        let next: Vec<String> = wf
            .get_next_tasks("t1", None)
            .unwrap()
            .into_iter()
            .map(|(n, ..)| n)
            .collect();
        assert_eq!(next, vec!["t2", "t4", "t7", "t9"]);
    }

    #[test]
    fn split_vs_join_classification() {
        let doc = json!({
            "tasks": {
                "t1": {"on-success": ["t3", "t4", "t9"]},
                "t3": {"on-success": "t5"},
                "t4": {"on-success": "t5"},
                "t5": {"join": "all", "on-success": "t6"},
                "t6": {},
                "t7": {"on-success": "t8"},
                "t8": {"on-success": "t9"},
                "t9": {}
            }
        });
        let (wf, _) = Workflow::from_value(&doc);
        assert!(wf.is_join_task("t5"));
        assert!(!wf.is_split_task("t5"));
        assert!(!wf.is_join_task("t9"));
        assert!(wf.is_split_task("t9"));
    }

    #[test]
    fn cycle_detection() {
        let doc = json!({
            "tasks": {
                "t1": {"on-success": "t2"},
                "t2": {"on-success": "t1"}
            }
        });
        let (wf, _) = Workflow::from_value(&doc);
        assert!(wf.in_cycle("t1"));
        assert!(wf.in_cycle("t2"));
        assert!(wf.has_cycles());
    }

    #[test]
    fn acyclic_graph_has_no_cycles() {
        let wf = linear_chain();
        assert!(!wf.has_cycles());
    }

    #[test]
    fn inspect_context_accumulates_published_names() {
        let doc = json!({
            "tasks": {
                "t1": {"publish": {"x": "<% ctx(y) %>"}, "on-success": "t2"},
                "t2": {"publish": {"z": "1"}}
            }
        });
        let (wf, _) = Workflow::from_value(&doc);
        let (errors, rolling) = wf.inspect_context(&[]);
        assert!(errors.is_empty());
        assert_eq!(rolling, vec!["x".to_string(), "z".to_string()]);
    }

    #[test]
    fn finalize_context_only_fires_on_literal_gate() {
        let doc = json!({
            "tasks": {
                "t": {"publish": {"x": "<% ctx(y) %>"}}
            }
        });
        let (wf, _) = Workflow::from_value(&doc);
        let task = wf.get_task("t").unwrap();
        let evaluator = LiteralEvaluator::new();

        let mut ctx = Context::new();
        ctx.set("y", json!(42));

        let (out, errors) = task.finalize_context(
            "t",
            Some("<% task_state(t) in ['succeeded'] %>"),
            &ctx,
            &evaluator,
        );
        assert!(errors.is_empty());
        assert_eq!(out.get("x"), Some(&json!(42)));

        let (out2, _) = task.finalize_context("t", Some("<% true %>"), &ctx, &evaluator);
        assert_eq!(out2.get("x"), None);
    }
}
