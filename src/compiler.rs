//! The Composer (C3): translates a validated [`Workflow`] into a
//! [`WorkflowGraph`].
//!
//! Shaped after the teacher crate's `compiler::lowering::lower`: a single
//! walk over the verified spec that emits graph artifacts node by node, edge
//! by edge, rather than the BPMN-to-bytecode lowering it performs there.

use crate::error::Result;
use crate::graph::WorkflowGraph;
use crate::spec::model::Workflow;
use serde_json::Value;
use tracing::debug;

/// Compile a validated [`Workflow`] spec into a [`WorkflowGraph`].
///
/// Unknown transition targets (a task referenced only as an `on-*` entry,
/// never defined in `tasks`) are not silently turned into graph nodes —
/// per spec §4.3 the composer leaves that for upstream validation to catch.
/// Composition here fails fast with `InvalidTask` instead.
pub fn compose(workflow: &Workflow) -> Result<WorkflowGraph> {
    let mut graph = WorkflowGraph::new();

    for name in workflow.tasks.names() {
        graph.add_task(name, Vec::<(String, Value)>::new());
        if workflow.is_join_task(name) {
            graph.update_task(name, [("barrier".to_string(), Value::String("*".to_string()))])?;
            debug!(task = %name, "marked join task as barrier");
        }
    }

    for name in workflow.tasks.names() {
        for (dst, criteria, clause) in workflow.get_next_tasks(name, None)? {
            if !workflow.tasks.contains(&dst) {
                return Err(crate::error::OrchestratorError::InvalidTask(dst));
            }
            graph.add_transition(name, &dst, criteria.clone())?;
            debug!(src = %name, dst = %dst, clause, criteria = ?criteria, "composed transition");
        }
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn composes_roots_matching_spec_start_tasks() {
        let doc = json!({
            "tasks": {
                "t1": {"on-success": "t2"},
                "t2": {}
            }
        });
        let (wf, errors) = Workflow::from_value(&doc);
        assert!(errors.is_empty());
        let graph = compose(&wf).unwrap();
        let roots: Vec<String> = graph.roots().into_iter().map(|r| r.id).collect();
        assert_eq!(roots, wf.get_start_tasks());
    }

    #[test]
    fn join_task_gets_barrier_attribute() {
        let doc = json!({
            "tasks": {
                "t1": {"on-success": ["t3", "t4"]},
                "t3": {"on-success": "t5"},
                "t4": {"on-success": "t5"},
                "t5": {"join": "all"}
            }
        });
        let (wf, _) = Workflow::from_value(&doc);
        let graph = compose(&wf).unwrap();
        assert!(graph.has_barrier("t5"));
        assert!(wf.is_join_task("t5"));
    }

    #[test]
    fn unknown_transition_target_fails_composition() {
        let doc = json!({
            "tasks": {
                "t1": {"on-success": "ghost"}
            }
        });
        let (wf, _) = Workflow::from_value(&doc);
        assert!(compose(&wf).is_err());
    }
}
