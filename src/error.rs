//! The crate's single error type, returned at every public boundary.

use crate::spec::schema::ValidationError;
use thiserror::Error;

/// Errors surfaced by the graph, spec model, composer, and conductor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("no transition from '{src}' to '{dst}'")]
    InvalidTaskTransition { src: String, dst: String },

    #[error("ambiguous transition from '{src}' to '{dst}': {count} edges")]
    AmbiguousTaskTransition {
        src: String,
        dst: String,
        count: usize,
    },

    #[error("expression evaluation failed: {0}")]
    ExpressionEvaluation(String),

    #[error("invalid workflow state: {0}")]
    InvalidWorkflowState(String),

    #[error("could not parse spec document: {0}")]
    DocumentParse(String),

    #[error("schema validation failed with {} error(s)", .0.len())]
    SchemaValidation(Vec<ValidationError>),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
