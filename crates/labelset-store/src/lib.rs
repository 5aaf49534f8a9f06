//! Labelset Store — SQLite JSON documents + in-process aggregation pipelines.

pub mod expr;
pub mod path;
pub mod pipeline;
pub mod schema;
pub mod sqlite;
pub mod types;

pub use expr::Expr;
pub use pipeline::{
    Accumulator, MergeOptions, Pipeline, Projection, Stage, WhenMatched, WhenNotMatched,
};
pub use sqlite::DocumentStore;
pub use types::*;
