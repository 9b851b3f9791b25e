//! The Spec Model (C2): schema declarations, the typed spec model, and the
//! structural queries (next/prev tasks, join/split, cycles) layered on it.

pub mod model;
pub mod query;
pub mod schema;
