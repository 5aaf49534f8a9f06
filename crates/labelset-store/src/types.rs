//! Store-level record types.

use serde::{Deserialize, Serialize};

/// A declared secondary index on a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    /// Index name, e.g. `sample_id` or `_sample_id_1_frame_number_1`.
    pub name: String,
    /// Storage field paths covered by the index, in order.
    pub keys: Vec<String>,
}

/// A persisted dataset record. `meta` is owned by the dataset layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub name: String,
    pub sample_collection: String,
    pub meta: serde_json::Value,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

/// Outcome of committing a pipeline's output to a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub inserted: usize,
    pub merged: usize,
    pub replaced: usize,
    pub kept: usize,
    pub discarded: usize,
}

/// Store-level statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_collections: i64,
    pub total_documents: i64,
    pub total_datasets: i64,
    pub db_path: String,
}
