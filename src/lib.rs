//! Workflow graph compiler and conductor.
//!
//! Compiles a declarative task spec — tasks linked by `on-success` /
//! `on-error` / `on-complete` transitions, with join/barrier semantics and
//! publish expressions — into a validated execution multigraph (C1/C3),
//! then drives that graph task-by-task through an append-only flow log
//! (C4). The crate has no internal scheduler loop: every operation is a
//! single synchronous step, driven by an external caller.
//!
//! ```text
//! spec::model / spec::schema   (C2 Spec Model)
//!          |
//!      compiler::compose       (C3 Composer)
//!          |
//!        graph                 (C1 Workflow Graph)
//!          |
//!      conductor                (C4 Conductor)
//! ```

pub mod compiler;
pub mod conductor;
pub mod context;
pub mod error;
pub mod expr;
pub mod flow;
pub mod graph;
pub mod spec;

pub use compiler::compose;
pub use conductor::{Conductor, RunnableTask};
pub use context::Context;
pub use error::{OrchestratorError, Result};
pub use expr::{EvaluatorRegistry, ExpressionEvaluator, LiteralEvaluator};
pub use flow::{FlowSequence, TaskFlowEntry, TaskState};
pub use graph::{SerializedGraph, TaskRef, Transition, WorkflowGraph};
pub use spec::model::{Task, TaskDefaults, TaskMapping, Workflow};
pub use spec::schema::ValidationError;
