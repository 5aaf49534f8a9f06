//! Database schema SQL.

/// Collections, their documents, declared indexes and dataset records.
///
/// `documents.seq` preserves insertion order within a collection; replacing
/// a document in place keeps its position.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL REFERENCES collections(name) ON DELETE CASCADE,
    doc_id TEXT NOT NULL,
    doc_json TEXT NOT NULL,
    UNIQUE (collection, doc_id)
);

CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection, seq);

CREATE TABLE IF NOT EXISTS collection_indexes (
    collection TEXT NOT NULL REFERENCES collections(name) ON DELETE CASCADE,
    name TEXT NOT NULL,
    sql_name TEXT NOT NULL,
    keys_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (collection, name)
);

CREATE TABLE IF NOT EXISTS datasets (
    name TEXT PRIMARY KEY,
    sample_collection TEXT NOT NULL,
    meta_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER
);
"#;
