//! The Workflow Graph (C1): an annotated directed multigraph over task ids.
//!
//! Nodes are task identifiers with an open attribute bag (notably `barrier`).
//! Edges are transitions carrying a `key` (parallel-edge index) and an
//! optional `criteria` expression string. Modeled the way the teacher
//! crate's compiler IR wraps `petgraph::graph::DiGraph` (see
//! `compiler::ir::IRGraph`), generalized from a BPMN element graph to a
//! plain task-id graph.

use crate::error::{OrchestratorError, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default)]
struct NodeData {
    id: String,
    attrs: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default)]
struct EdgeData {
    key: u32,
    criteria: Option<String>,
}

/// A task descriptor as returned by [`WorkflowGraph::roots`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
    pub name: String,
}

/// One directed edge, as returned by the transition lookups: `(src, dst, key, criteria)`.
pub type Transition = (String, String, u32, Option<String>);

/// The directed multigraph of tasks and transitions.
#[derive(Clone, Debug, Default)]
pub struct WorkflowGraph {
    graph: DiGraph<NodeData, EdgeData>,
    index: BTreeMap<String, NodeIndex>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: BTreeMap::new(),
        }
    }

    fn node_idx(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    /// Idempotent: re-adding an existing id merges/overwrites attributes.
    pub fn add_task<I, K, V>(&mut self, id: &str, attrs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let idx = match self.node_idx(id) {
            Some(idx) => idx,
            None => {
                let idx = self.graph.add_node(NodeData {
                    id: id.to_string(),
                    attrs: BTreeMap::new(),
                });
                self.index.insert(id.to_string(), idx);
                idx
            }
        };
        let node = &mut self.graph[idx];
        for (k, v) in attrs {
            node.attrs.insert(k.into(), v.into());
        }
    }

    /// Fails with `InvalidTask` if `id` is not already present.
    pub fn update_task<I, K, V>(&mut self, id: &str, attrs: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let idx = self
            .node_idx(id)
            .ok_or_else(|| OrchestratorError::InvalidTask(id.to_string()))?;
        let node = &mut self.graph[idx];
        for (k, v) in attrs {
            node.attrs.insert(k.into(), v.into());
        }
        Ok(())
    }

    /// Returns the task's attribute map, including its `id`.
    pub fn get_task(&self, id: &str) -> Result<BTreeMap<String, Value>> {
        let idx = self
            .node_idx(id)
            .ok_or_else(|| OrchestratorError::InvalidTask(id.to_string()))?;
        let node = &self.graph[idx];
        let mut out = node.attrs.clone();
        out.insert("id".to_string(), Value::String(node.id.clone()));
        Ok(out)
    }

    pub fn has_task(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Auto-creates missing endpoints with no extra attributes. Fails with
    /// `AmbiguousTaskTransition` if an edge between `src` and `dst` already
    /// exists — the public API enforces at most one edge per ordered
    /// endpoint pair; true parallel edges can only arise through lower-level
    /// graph construction (mirrors `orchestra`'s `add_transition`, which
    /// raises the same way).
    pub fn add_transition(
        &mut self,
        src: &str,
        dst: &str,
        criteria: Option<String>,
    ) -> Result<()> {
        let existing = self.count_edges(src, dst);
        if existing > 0 {
            return Err(OrchestratorError::AmbiguousTaskTransition {
                src: src.to_string(),
                dst: dst.to_string(),
                count: existing + 1,
            });
        }
        let src_idx = self.ensure_node(src);
        let dst_idx = self.ensure_node(dst);
        self.graph.add_edge(
            src_idx,
            dst_idx,
            EdgeData { key: 0, criteria },
        );
        Ok(())
    }

    fn ensure_node(&mut self, id: &str) -> NodeIndex {
        if let Some(idx) = self.node_idx(id) {
            return idx;
        }
        let idx = self.graph.add_node(NodeData {
            id: id.to_string(),
            attrs: BTreeMap::new(),
        });
        self.index.insert(id.to_string(), idx);
        idx
    }

    fn count_edges(&self, src: &str, dst: &str) -> usize {
        let (Some(s), Some(d)) = (self.node_idx(src), self.node_idx(dst)) else {
            return 0;
        };
        self.graph
            .edges_connecting(s, d)
            .count()
    }

    /// Low-level escape hatch used only by tests that need to simulate
    /// fixture-loaded parallel edges (mirrors the Python test suite poking
    /// `wf_graph._graph.add_edge` directly).
    #[doc(hidden)]
    pub fn add_raw_edge(&mut self, src: &str, dst: &str, criteria: Option<String>) {
        let key = self.count_edges(src, dst) as u32;
        let src_idx = self.ensure_node(src);
        let dst_idx = self.ensure_node(dst);
        self.graph
            .add_edge(src_idx, dst_idx, EdgeData { key, criteria });
    }

    /// Fails `InvalidTaskTransition` if no edge exists, `AmbiguousTaskTransition`
    /// if more than one.
    pub fn get_transition(&self, src: &str, dst: &str) -> Result<Transition> {
        let edges = self.edges_between(src, dst)?;
        match edges.len() {
            0 => Err(OrchestratorError::InvalidTaskTransition {
                src: src.to_string(),
                dst: dst.to_string(),
            }),
            1 => Ok(edges.into_iter().next().unwrap()),
            n => Err(OrchestratorError::AmbiguousTaskTransition {
                src: src.to_string(),
                dst: dst.to_string(),
                count: n,
            }),
        }
    }

    fn edges_between(&self, src: &str, dst: &str) -> Result<Vec<Transition>> {
        let s = self
            .node_idx(src)
            .ok_or_else(|| OrchestratorError::InvalidTask(src.to_string()))?;
        let d = match self.node_idx(dst) {
            Some(d) => d,
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::new();
        for edge in self.graph.edges_connecting(s, d) {
            let data = edge.weight();
            out.push((src.to_string(), dst.to_string(), data.key, data.criteria.clone()));
        }
        Ok(out)
    }

    /// All outgoing transitions from `id`, as 4-tuples.
    pub fn get_next_transitions(&self, id: &str) -> Result<Vec<Transition>> {
        let idx = self
            .node_idx(id)
            .ok_or_else(|| OrchestratorError::InvalidTask(id.to_string()))?;
        let mut out: Vec<Transition> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|edge| {
                let dst = &self.graph[edge.target()].id;
                (id.to_string(), dst.clone(), edge.weight().key, edge.weight().criteria.clone())
            })
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));
        Ok(out)
    }

    /// All incoming transitions into `id`, as 4-tuples.
    pub fn get_prev_transitions(&self, id: &str) -> Result<Vec<Transition>> {
        let idx = self
            .node_idx(id)
            .ok_or_else(|| OrchestratorError::InvalidTask(id.to_string()))?;
        let mut out: Vec<Transition> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|edge| {
                let src = &self.graph[edge.source()].id;
                (src.clone(), id.to_string(), edge.weight().key, edge.weight().criteria.clone())
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0).then(a.2.cmp(&b.2)));
        Ok(out)
    }

    /// True iff the node's `barrier` attribute is set.
    pub fn has_barrier(&self, id: &str) -> bool {
        self.node_idx(id)
            .map(|idx| self.graph[idx].attrs.contains_key("barrier"))
            .unwrap_or(false)
    }

    /// Tasks with zero incoming edges, sorted by id.
    pub fn roots(&self) -> Vec<TaskRef> {
        let mut out: Vec<TaskRef> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .edges_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| TaskRef {
                id: self.graph[idx].id.clone(),
                name: self.graph[idx].id.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Mapping from every task id to the value of attribute `name`, or `null`.
    pub fn get_task_attributes(&self, name: &str) -> BTreeMap<String, Value> {
        self.index
            .keys()
            .map(|id| {
                let idx = self.index[id];
                let value = self.graph[idx]
                    .attrs
                    .get(name)
                    .cloned()
                    .unwrap_or(Value::Null);
                (id.clone(), value)
            })
            .collect()
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    /// Serialize to the `{directed, multigraph, graph, nodes, adjacency}` form.
    pub fn serialize(&self) -> SerializedGraph {
        let mut node_order: Vec<NodeIndex> = self.graph.node_indices().collect();
        node_order.sort_by_key(|&idx| self.graph[idx].id.clone());

        let position: BTreeMap<NodeIndex, usize> = node_order
            .iter()
            .enumerate()
            .map(|(i, &idx)| (idx, i))
            .collect();

        let nodes: Vec<SerializedNode> = node_order
            .iter()
            .map(|&idx| {
                let data = &self.graph[idx];
                SerializedNode {
                    id: data.id.clone(),
                    attrs: data.attrs.clone(),
                }
            })
            .collect();

        let mut adjacency: Vec<Vec<SerializedEdge>> = vec![Vec::new(); node_order.len()];
        for &idx in &node_order {
            let pos = position[&idx];
            let mut edges: Vec<SerializedEdge> = self
                .graph
                .edges_directed(idx, Direction::Outgoing)
                .map(|edge| SerializedEdge {
                    id: self.graph[edge.target()].id.clone(),
                    key: edge.weight().key,
                    criteria: edge.weight().criteria.clone(),
                })
                .collect();
            edges.sort_by(|a, b| a.id.cmp(&b.id).then(a.key.cmp(&b.key)));
            adjacency[pos] = edges;
        }

        SerializedGraph {
            directed: true,
            multigraph: true,
            graph: Vec::new(),
            nodes,
            adjacency,
        }
    }

    /// Deserialize from the `serialize()` form. Unknown edge targets are a
    /// corrupt-state error per invariant I1.
    pub fn deserialize(doc: &SerializedGraph) -> Result<Self> {
        let mut g = Self::new();
        for node in &doc.nodes {
            g.add_task(&node.id, node.attrs.clone());
        }
        for (i, edges) in doc.adjacency.iter().enumerate() {
            let src = doc
                .nodes
                .get(i)
                .ok_or_else(|| {
                    OrchestratorError::InvalidWorkflowState(
                        "adjacency list longer than node list".to_string(),
                    )
                })?
                .id
                .clone();
            for edge in edges {
                if !g.has_task(&edge.id) {
                    return Err(OrchestratorError::InvalidWorkflowState(format!(
                        "adjacency references unknown task '{}'",
                        edge.id
                    )));
                }
                g.add_raw_edge(&src, &edge.id, edge.criteria.clone());
            }
        }
        Ok(g)
    }

    #[cfg(test)]
    fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedNode {
    pub id: String,
    #[serde(flatten)]
    pub attrs: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedEdge {
    pub id: String,
    pub key: u32,
    pub criteria: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedGraph {
    pub directed: bool,
    pub multigraph: bool,
    pub graph: Vec<Value>,
    pub nodes: Vec<SerializedNode>,
    pub adjacency: Vec<Vec<SerializedEdge>>,
}
