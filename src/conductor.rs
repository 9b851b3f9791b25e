//! The Conductor (C4): drives task-by-task execution of a composed
//! [`WorkflowGraph`], one flow entry at a time, entirely as a pure state
//! machine — no internal threads, timers, or I/O (spec §5).
//!
//! Shaped after the teacher crate's `engine::Engine`: a small struct
//! wrapping compiled artifacts plus a mutable run log, driven by an
//! external caller one step at a time rather than looping internally.
//! The actual scheduling algorithm (start tasks, next-task proposal,
//! barrier release, retry policy) is ported from
//! `orchestra/conducting/workflow.py`'s `WorkflowConductor`.

use crate::context::Context;
use crate::error::{OrchestratorError, Result};
use crate::expr::ExpressionEvaluator;
use crate::flow::{FlowSequence, TaskFlowEntry, TaskState};
use crate::graph::{SerializedGraph, WorkflowGraph};
use crate::spec::model::Workflow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A task proposed as runnable: its id and the context it should receive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunnableTask {
    pub id: String,
    pub name: String,
    pub ctx: Context,
}

/// Parse a `<% task_state(ID) in ['a', 'b'] %>`-shaped criteria expression
/// into `(task_id, allowed_states)`. Returns `None` for any other shape,
/// in which case the criteria is handed to the generic evaluator instead.
fn parse_task_state_criteria(criteria: &str) -> Option<(String, Vec<String>)> {
    let body = criteria
        .trim()
        .strip_prefix("<%")?
        .strip_suffix("%>")?
        .trim();
    let rest = body.strip_prefix("task_state(")?;
    let close = rest.find(')')?;
    let task_id = rest[..close].trim().to_string();
    let rest = rest[close + 1..].trim().strip_prefix("in")?.trim();
    let rest = rest.strip_prefix('[')?.strip_suffix(']')?;
    let states: Vec<String> = rest
        .split(',')
        .map(|s| s.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
        .filter(|s| !s.is_empty())
        .collect();
    Some((task_id, states))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        _ => true,
    }
}

/// The full on-disk/over-the-wire conductor state (spec §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ConductorDoc {
    spec: Value,
    graph: SerializedGraph,
    flow: FlowSequence,
    state: TaskState,
    input: Context,
    output: Context,
}

/// Drives a single workflow execution. Owns the composed graph and the
/// append-only flow log; holds no internal scheduler state beyond those —
/// every query recomputes its answer from the log, so serialization never
/// has to capture anything beyond what `ConductorDoc` already lists.
pub struct Conductor {
    raw_spec: Value,
    workflow: Workflow,
    graph: WorkflowGraph,
    flow: FlowSequence,
    state: TaskState,
    input: Context,
    output: Context,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl Conductor {
    /// Parse, validate and compose `raw_spec`, failing with
    /// `SchemaValidation` if the spec has any schema violations.
    pub fn new(raw_spec: Value, evaluator: Arc<dyn ExpressionEvaluator>) -> Result<Self> {
        let (workflow, errors) = Workflow::from_value(&raw_spec);
        if !errors.is_empty() {
            return Err(OrchestratorError::SchemaValidation(errors));
        }
        let graph = crate::compiler::compose(&workflow)?;
        let input = Context::from_map(workflow.input.clone());

        Ok(Self {
            raw_spec,
            workflow,
            graph,
            flow: FlowSequence::new(),
            state: TaskState::Requested,
            input,
            output: Context::new(),
            evaluator,
        })
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn output(&self) -> &Context {
        &self.output
    }

    /// The graph's root tasks, each handed the workflow's top-level input
    /// context. Transitions the conductor to `RUNNING` on first call.
    pub fn get_start_tasks(&mut self) -> Vec<RunnableTask> {
        if self.state == TaskState::Requested {
            self.state = TaskState::Running;
            info!("workflow started");
        }
        self.graph
            .roots()
            .into_iter()
            .map(|r| RunnableTask {
                id: r.id.clone(),
                name: r.id,
                ctx: self.input.clone(),
            })
            .collect()
    }

    /// Record `task_id` reaching `new_state`, finalizing its context and
    /// running the retry policy if the new state is terminal.
    ///
    /// A non-terminal re-entry (e.g. `RUNNING` after `REQUESTED`) mutates
    /// the current flow entry in place; a terminal state after a prior
    /// terminal state starts a new entry — the retry case.
    pub fn update_task_flow_entry(
        &mut self,
        task_id: &str,
        new_state: TaskState,
        ctx: Option<Context>,
    ) -> Result<()> {
        if !self.workflow.tasks.contains(task_id) {
            return Err(OrchestratorError::InvalidTask(task_id.to_string()));
        }

        match self.flow.last_entry_mut(task_id) {
            Some(entry) if !entry.state.is_terminal() => {
                entry.state = new_state;
            }
            _ => {
                self.flow.sequence.push(TaskFlowEntry::new(task_id, new_state));
            }
        }
        debug!(task = %task_id, state = ?new_state, "task flow entry updated");

        if new_state.is_terminal() {
            let ctx = ctx.unwrap_or_default();
            let idx = self.flow.push_ctx(ctx.clone());
            if let Some(entry) = self.flow.last_entry_mut(task_id) {
                entry.ctx_idx = Some(idx);
            }
            self.finalize_transitions(task_id, new_state, &ctx)?;
            self.maybe_schedule_retry(task_id)?;
        }

        self.refresh_terminal_state();
        Ok(())
    }

    /// Evaluate `publish` for every transition out of `task_id` triggered by
    /// `new_state`'s clauses and record each destination's post-finalize
    /// context for later pickup by [`Self::get_next_tasks`].
    fn finalize_transitions(&mut self, task_id: &str, new_state: TaskState, ctx: &Context) -> Result<()> {
        let clauses = new_state.triggered_clauses();
        if clauses.is_empty() {
            return Ok(());
        }
        let task = self.workflow.get_task(task_id)?.clone();
        let transitions = self.workflow.get_next_tasks(task_id, Some(clauses))?;

        for (dst, criteria, _clause) in transitions {
            let (out_ctx, errors) = task.finalize_context(task_id, criteria.as_deref(), ctx, self.evaluator.as_ref());
            if !errors.is_empty() {
                warn!(task = %task_id, dst = %dst, ?errors, "publish expression errors");
                if let Some(entry) = self.flow.last_entry_mut(task_id) {
                    entry.errors.extend(errors);
                }
            }
            let idx = self.flow.push_ctx(out_ctx);
            if let Some(entry) = self.flow.last_entry_mut(task_id) {
                entry.published.insert(dst, idx);
            }
        }
        Ok(())
    }

    /// Append a fresh `REQUESTED` entry for `task_id` if it just failed and
    /// its retry policy has attempts remaining.
    fn maybe_schedule_retry(&mut self, task_id: &str) -> Result<()> {
        let task = self.workflow.get_task(task_id)?.clone();
        let Some(retry) = task.retry.as_ref() else {
            return Ok(());
        };
        let is_failure = self
            .flow
            .last_entry(task_id)
            .map(|e| e.state.is_failure())
            .unwrap_or(false);
        if !is_failure {
            return Ok(());
        }
        let attempts = self
            .flow
            .sequence
            .iter()
            .filter(|e| e.id == task_id && e.state.is_failure())
            .count() as u32;
        if attempts <= retry.count {
            let mut entry = TaskFlowEntry::new(task_id, TaskState::Requested);
            entry.retry_attempt = attempts;
            self.flow.sequence.push(entry);
            info!(task = %task_id, attempt = attempts, delay_ms = retry.delay_ms, "scheduled retry");
        }
        Ok(())
    }

    /// Resolve whether a single transition's criteria fires: `task_state(X)
    /// in [...]` is resolved directly against the flow log (it asks about
    /// conducting state, not data context); anything else is handed to the
    /// expression evaluator and interpreted as truthy/falsy.
    fn evaluate_criteria(&self, criteria: &str, ctx: &Context) -> bool {
        if let Some((task_id, states)) = parse_task_state_criteria(criteria) {
            let actual = self.flow.last_entry(&task_id).map(|e| e.state.as_lower());
            return actual.map(|a| states.iter().any(|s| s == a)).unwrap_or(false);
        }
        match self.evaluator.evaluate(criteria, ctx) {
            Ok(value) => truthy(&value),
            Err(e) => {
                warn!(criteria, error = %e, "criteria evaluation failed, treating as false");
                false
            }
        }
    }

    /// Whether a predecessor's transition into `dst` fired true, given that
    /// predecessor's terminal state. `None` means the predecessor hasn't
    /// reached a terminal state yet — the edge is still undecided.
    fn predecessor_decision(&self, src: &str, dst: &str) -> Option<bool> {
        let entry = self.flow.last_entry(src)?;
        if !entry.state.is_terminal() {
            return None;
        }
        let clauses = entry.state.triggered_clauses();
        if clauses.is_empty() {
            return Some(false);
        }
        let Ok(next) = self.workflow.get_next_tasks(src, Some(clauses)) else {
            return Some(false);
        };
        let Some((_, criteria, _)) = next.iter().find(|(d, ..)| d == dst) else {
            return Some(false);
        };
        let ctx = entry
            .published
            .get(dst)
            .and_then(|&idx| self.flow.ctx_at(idx))
            .cloned()
            .unwrap_or_default();
        Some(match criteria {
            None => true,
            Some(c) => self.evaluate_criteria(c, &ctx),
        })
    }

    /// Successors of `task_id` that are runnable now: non-barrier
    /// successors whose transition fired; barrier successors only once
    /// every inbound edge has either fired or been proven impossible, with
    /// their contexts unioned.
    ///
    /// A barrier downstream of `task_id` must be re-checked even when
    /// `task_id`'s own edge into it didn't fire (e.g. `task_id` failed and
    /// only its `on-success` clause targets the barrier) — `task_id`
    /// reaching a terminal state still decides that inbound edge as
    /// "proven impossible", which can be exactly the last piece another
    /// barrier was waiting on. So every graph successor of `task_id` that
    /// is a barrier is considered for release, not just the ones `task_id`
    /// itself fired into this step.
    pub fn get_next_tasks(&self, task_id: &str) -> Result<Vec<RunnableTask>> {
        if !self.workflow.tasks.contains(task_id) {
            return Err(OrchestratorError::InvalidTask(task_id.to_string()));
        }
        let Some(entry) = self.flow.last_entry(task_id) else {
            return Ok(Vec::new());
        };
        if !entry.state.is_terminal() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let clauses = entry.state.triggered_clauses();
        if !clauses.is_empty() {
            for (dst, criteria, _clause) in self.workflow.get_next_tasks(task_id, Some(clauses))? {
                if self.graph.has_barrier(&dst) {
                    continue;
                }
                let out_ctx = entry
                    .published
                    .get(&dst)
                    .and_then(|&idx| self.flow.ctx_at(idx))
                    .cloned()
                    .unwrap_or_default();
                let fires = match &criteria {
                    None => true,
                    Some(c) => self.evaluate_criteria(c, &out_ctx),
                };
                if !fires {
                    continue;
                }
                out.push(RunnableTask {
                    id: dst.clone(),
                    name: dst,
                    ctx: out_ctx,
                });
            }
        }

        let mut barriers: BTreeSet<String> = BTreeSet::new();
        for (_, dst, _, _) in self.graph.get_next_transitions(task_id)? {
            if self.graph.has_barrier(&dst) {
                barriers.insert(dst);
            }
        }
        for dst in barriers {
            if let Some(released_ctx) = self.try_release_barrier(&dst)? {
                out.push(RunnableTask {
                    id: dst.clone(),
                    name: dst,
                    ctx: released_ctx,
                });
            }
        }
        Ok(out)
    }

    /// Check every inbound edge into barrier task `dst`: `Some(ctx)` once
    /// all are decided and at least one fired, `None` while still pending.
    fn try_release_barrier(&self, dst: &str) -> Result<Option<Context>> {
        let prevs = self.graph.get_prev_transitions(dst)?;
        let mut union_ctx = Context::new();
        let mut any_fired = false;

        for (src, ..) in prevs {
            match self.predecessor_decision(&src, dst) {
                None => return Ok(None),
                Some(true) => {
                    any_fired = true;
                    if let Some(entry) = self.flow.last_entry(&src) {
                        if let Some(pctx) = entry.published.get(dst).and_then(|&idx| self.flow.ctx_at(idx)) {
                            union_ctx = union_ctx.merged_and_stripped(pctx.as_map());
                        }
                    }
                }
                Some(false) => {}
            }
        }

        if any_fired {
            debug!(task = %dst, "barrier released");
            Ok(Some(union_ctx))
        } else {
            Ok(None)
        }
    }

    /// Once every task has a terminal flow entry, resolve the workflow's
    /// overall state and output context.
    fn refresh_terminal_state(&mut self) {
        let all_terminal = self
            .workflow
            .tasks
            .names()
            .all(|name| self.flow.last_entry(name).map(|e| e.state.is_terminal()).unwrap_or(false));
        if !all_terminal {
            return;
        }

        let any_failed = self
            .workflow
            .tasks
            .names()
            .any(|name| self.flow.last_entry(name).map(|e| e.state.is_failure()).unwrap_or(false));
        self.state = if any_failed { TaskState::Failed } else { TaskState::Succeeded };
        info!(state = ?self.state, "workflow complete");

        let mut out = self.input.clone();
        for name in self.workflow.tasks.names() {
            if let Some(entry) = self.flow.last_entry(name) {
                if let Some(idx) = entry.ctx_idx {
                    if let Some(ctx) = self.flow.ctx_at(idx) {
                        out = out.merged_and_stripped(ctx.as_map());
                    }
                }
            }
        }
        self.output = out;
    }

    /// Serialize the full conductor state to the wire form described in
    /// spec §6.
    pub fn serialize(&self) -> Value {
        let doc = ConductorDoc {
            spec: self.raw_spec.clone(),
            graph: self.graph.serialize(),
            flow: self.flow.clone(),
            state: self.state,
            input: self.input.clone(),
            output: self.output.clone(),
        };
        serde_json::to_value(doc).expect("ConductorDoc is always representable as JSON")
    }

    /// Rebuild a `Conductor` from a document produced by [`Self::serialize`].
    pub fn deserialize(doc: Value, evaluator: Arc<dyn ExpressionEvaluator>) -> Result<Self> {
        let parsed: ConductorDoc = serde_json::from_value(doc)
            .map_err(|e| OrchestratorError::InvalidWorkflowState(e.to_string()))?;

        let (workflow, errors) = Workflow::from_value(&parsed.spec);
        if !errors.is_empty() {
            return Err(OrchestratorError::SchemaValidation(errors));
        }
        let graph = WorkflowGraph::deserialize(&parsed.graph)?;

        Ok(Self {
            raw_spec: parsed.spec,
            workflow,
            graph,
            flow: parsed.flow,
            state: parsed.state,
            input: parsed.input,
            output: parsed.output,
            evaluator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::LiteralEvaluator;
    use serde_json::json;

    fn evaluator() -> Arc<dyn ExpressionEvaluator> {
        Arc::new(LiteralEvaluator::new())
    }

    #[test]
    fn parses_task_state_criteria() {
        let (id, states) = parse_task_state_criteria("<% task_state(t1) in ['succeeded', 'failed'] %>").unwrap();
        assert_eq!(id, "t1");
        assert_eq!(states, vec!["succeeded".to_string(), "failed".to_string()]);
        assert!(parse_task_state_criteria("<% ctx(y) %>").is_none());
    }

    #[test]
    fn linear_chain_runs_start_to_finish() {
        let doc = json!({
            "tasks": {
                "t1": {"on-success": "t2"},
                "t2": {}
            }
        });
        let mut c = Conductor::new(doc, evaluator()).unwrap();
        let starts = c.get_start_tasks();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].id, "t1");

        c.update_task_flow_entry("t1", TaskState::Running, None).unwrap();
        c.update_task_flow_entry("t1", TaskState::Succeeded, Some(Context::new())).unwrap();
        let next = c.get_next_tasks("t1").unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, "t2");

        c.update_task_flow_entry("t2", TaskState::Running, None).unwrap();
        c.update_task_flow_entry("t2", TaskState::Succeeded, Some(Context::new())).unwrap();
        assert_eq!(c.state(), TaskState::Succeeded);
    }

    #[test]
    fn barrier_waits_for_every_predecessor() {
        let doc = json!({
            "tasks": {
                "t1": {"on-success": ["t2", "t3"]},
                "t2": {"on-success": "t4"},
                "t3": {"on-success": "t4"},
                "t4": {"join": "all"}
            }
        });
        let mut c = Conductor::new(doc, evaluator()).unwrap();
        c.get_start_tasks();
        c.update_task_flow_entry("t1", TaskState::Succeeded, Some(Context::new())).unwrap();
        assert_eq!(c.get_next_tasks("t1").unwrap().len(), 2);

        c.update_task_flow_entry("t2", TaskState::Succeeded, Some(Context::new())).unwrap();
        assert!(c.get_next_tasks("t2").unwrap().is_empty(), "barrier must wait for t3");

        c.update_task_flow_entry("t3", TaskState::Succeeded, Some(Context::new())).unwrap();
        let released = c.get_next_tasks("t3").unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, "t4");
    }

    #[test]
    fn barrier_releases_when_a_predecessor_fails_via_a_different_clause() {
        // t2 -> t5 (on-success), t3 -> t5 (on-success), t5 join: all.
        // t3 fails instead of succeeding: its terminal state only triggers
        // on-error/on-complete, neither of which has an edge to t5, so the
        // t3->t5 edge is proven impossible rather than fired. The barrier
        // must still release on t2's context alone, driven off t3 reaching
        // a terminal state at all, not off t3 firing into t5.
        let doc = json!({
            "tasks": {
                "t2": {"on-success": "t5"},
                "t3": {"on-success": "t5"},
                "t5": {"join": "all"}
            }
        });
        let mut c = Conductor::new(doc, evaluator()).unwrap();
        c.get_start_tasks();

        c.update_task_flow_entry("t2", TaskState::Succeeded, Some(Context::new())).unwrap();
        assert!(c.get_next_tasks("t2").unwrap().is_empty(), "barrier must wait for t3");

        c.update_task_flow_entry("t3", TaskState::Failed, Some(Context::new())).unwrap();
        let released = c.get_next_tasks("t3").unwrap();
        assert_eq!(released.len(), 1, "t3 failing must still decide the barrier, not strand it");
        assert_eq!(released[0].id, "t5");
    }

    #[test]
    fn publish_gate_populates_successor_context() {
        let doc = json!({
            "tasks": {
                "t1": {
                    "publish": {"x": "<% ctx(y) %>"},
                    "on-success": [{"t2": "<% task_state(t1) in ['succeeded'] %>"}]
                },
                "t2": {}
            }
        });
        let mut c = Conductor::new(doc, evaluator()).unwrap();
        c.get_start_tasks();
        let mut ctx = Context::new();
        ctx.set("y", json!(7));
        c.update_task_flow_entry("t1", TaskState::Succeeded, Some(ctx)).unwrap();
        let next = c.get_next_tasks("t1").unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].ctx.get("x"), Some(&json!(7)));
    }

    #[test]
    fn failed_task_without_retry_marks_workflow_failed() {
        let doc = json!({"tasks": {"t1": {}}});
        let mut c = Conductor::new(doc, evaluator()).unwrap();
        c.get_start_tasks();
        c.update_task_flow_entry("t1", TaskState::Failed, Some(Context::new())).unwrap();
        assert_eq!(c.state(), TaskState::Failed);
    }

    #[test]
    fn retry_policy_reenters_task_on_failure() {
        let doc = json!({
            "tasks": {
                "t1": {"retry": {"count": 1, "delay-ms": 0}}
            }
        });
        let mut c = Conductor::new(doc, evaluator()).unwrap();
        c.get_start_tasks();
        c.update_task_flow_entry("t1", TaskState::Failed, Some(Context::new())).unwrap();
        let entries: Vec<_> = c.flow.sequence.iter().filter(|e| e.id == "t1").collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].state, TaskState::Requested);
    }

    #[test]
    fn serialize_deserialize_round_trip_preserves_state() {
        let doc = json!({"tasks": {"t1": {"on-success": "t2"}, "t2": {}}});
        let mut c = Conductor::new(doc, evaluator()).unwrap();
        c.get_start_tasks();
        c.update_task_flow_entry("t1", TaskState::Succeeded, Some(Context::new())).unwrap();

        let wire = c.serialize();
        let c2 = Conductor::deserialize(wire, evaluator()).unwrap();
        assert_eq!(c2.state(), c.state());
        assert_eq!(c2.get_next_tasks("t1").unwrap(), c.get_next_tasks("t1").unwrap());
    }
}
