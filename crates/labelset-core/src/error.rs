//! Error types for Labelset.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A document write was rejected, e.g. two patches claiming one `_id`.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Missing dataset, sample, patch or evaluation run.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The label field holds a type that cannot be split into patches.
    #[error("Cannot build patches from label type {0}")]
    UnsupportedLabelType(String),

    /// Unknown field, conflicting field kind, or a value that does not fit
    /// the field's shape.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Malformed stage list, such as a sink in the middle of a view.
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The request does not fit the dataset it targets, e.g. frame-level
    /// patches of a video dataset or a name already taken. Raised before
    /// anything is written.
    #[error("Invalid request: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
