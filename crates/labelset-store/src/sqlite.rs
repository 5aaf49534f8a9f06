//! SQLite-backed JSON document store.
//!
//! Each collection is a named, ordered set of JSON documents keyed by their
//! `_id`. Aggregation pipelines run in-process over a collection snapshot;
//! a trailing `Out`/`Merge` sink is committed in a single transaction.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::pipeline::{run_stages, MergeOptions, Pipeline, Stage, WhenMatched, WhenNotMatched};
use crate::schema::SCHEMA_SQL;
use crate::types::*;
use labelset_core::{generate_id, Error, LabelsetConfig, Result};

/// SQLite store holding JSON documents grouped into collections.
pub struct DocumentStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
    /// Source of `Expr::Rand` values.
    rng: Mutex<StdRng>,
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Quote a string as an SQL literal.
fn sql_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn json_path_literal(key: &str) -> String {
    sql_literal(&format!("$.{}", key))
}

fn doc_id_of(doc: &Value) -> Option<String> {
    doc.get("_id").and_then(|v| v.as_str()).map(str::to_string)
}

/// Ensure `doc` is an object with a string `_id`, generating one if absent.
fn ensure_id(doc: &mut Value) -> Result<String> {
    let Value::Object(map) = doc else {
        return Err(Error::Storage(format!(
            "documents must be JSON objects, got {}",
            doc
        )));
    };
    match map.get("_id") {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(other) => Err(Error::Storage(format!("invalid _id {}", other))),
        None => {
            let id = generate_id();
            map.insert("_id".to_string(), Value::String(id.clone()));
            Ok(id)
        }
    }
}

fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as SqlValue;
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

impl DocumentStore {
    /// Open or create the store in `db_dir/labelset.db`.
    pub fn open(db_dir: impl AsRef<Path>, rand_seed: Option<u64>) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir).map_err(|e| Error::Storage(e.to_string()))?;
        let db_path = db_dir.join("labelset.db");

        let conn = Connection::open(&db_path).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(db_err)?;

        let store = Self::init(conn, Some(db_path), rand_seed)?;
        let stats = store.get_stats()?;
        info!(
            "DocumentStore initialized: {} collections, {} documents, {} datasets, path={}",
            stats.total_collections, stats.total_documents, stats.total_datasets, stats.db_path
        );
        Ok(store)
    }

    /// Open the store described by `config`.
    pub fn from_config(config: &LabelsetConfig) -> Result<Self> {
        Self::open(&config.data_paths.db, config.rand_seed)
    }

    /// Open a private in-memory store.
    pub fn open_in_memory(rand_seed: Option<u64>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(db_err)?;
        Self::init(conn, None, rand_seed)
    }

    fn init(conn: Connection, db_path: Option<PathBuf>, rand_seed: Option<u64>) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        let rng = match rand_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            rng: Mutex::new(rng),
        })
    }

    // ---------------------------------------------------------------
    // Collections
    // ---------------------------------------------------------------

    /// Create a collection if it does not exist.
    pub fn create_collection(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO collections (name, created_at) VALUES (?1, ?2)",
            params![name, now_millis()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn collection_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM collections WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    /// Drop a collection, its documents and its indexes.
    pub fn drop_collection(&self, name: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let sql_names: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT sql_name FROM collection_indexes WHERE collection = ?1")
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![name], |row| row.get(0))
                .map_err(db_err)?;
            rows.filter_map(|r| r.ok()).collect()
        };
        for sql_name in &sql_names {
            tx.execute_batch(&format!("DROP INDEX IF EXISTS {}", sql_name))
                .map_err(db_err)?;
        }
        let count = tx
            .execute("DELETE FROM collections WHERE name = ?1", params![name])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        if count > 0 {
            debug!("Dropped collection {}", name);
        }
        Ok(count > 0)
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT name FROM collections ORDER BY name")
            .map_err(db_err)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(db_err)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ---------------------------------------------------------------
    // Document CRUD
    // ---------------------------------------------------------------

    /// Insert a document, generating `_id` if absent. Returns the id.
    pub fn insert_document(&self, collection: &str, doc: Value) -> Result<String> {
        let ids = self.insert_documents(collection, vec![doc])?;
        ids.into_iter()
            .next()
            .ok_or_else(|| Error::Internal("insert returned no id".into()))
    }

    /// Insert documents in one transaction. Fails on duplicate `_id`.
    pub fn insert_documents(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<String>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        Self::ensure_collection(&tx, collection)?;
        let mut ids = Vec::with_capacity(docs.len());
        for mut doc in docs {
            let id = ensure_id(&mut doc)?;
            Self::insert_row(&tx, collection, &id, &doc)?;
            ids.push(id);
        }
        tx.commit().map_err(db_err)?;
        Ok(ids)
    }

    pub fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .prepare_cached("SELECT doc_json FROM documents WHERE collection = ?1 AND doc_id = ?2")
            .map_err(db_err)?
            .query_row(params![collection, id], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        json.map(|s| serde_json::from_str(&s).map_err(Error::from))
            .transpose()
    }

    /// All documents of a collection in insertion order.
    pub fn find_all(&self, collection: &str) -> Result<Vec<Value>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT doc_json FROM documents WHERE collection = ?1 ORDER BY seq")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![collection], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut docs = Vec::new();
        for row in rows {
            let json = row.map_err(db_err)?;
            docs.push(serde_json::from_str(&json)?);
        }
        Ok(docs)
    }

    /// Documents whose top-level `key` equals `value`, served by an index
    /// on `key` when one exists.
    pub fn find_by_field(&self, collection: &str, key: &str, value: &Value) -> Result<Vec<Value>> {
        let sql = format!(
            "SELECT doc_json FROM documents \
             WHERE collection = {} AND json_extract(doc_json, {}) = ?1 ORDER BY seq",
            sql_literal(collection),
            json_path_literal(key)
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![json_to_sql(value)], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut docs = Vec::new();
        for row in rows {
            let json = row.map_err(db_err)?;
            docs.push(serde_json::from_str(&json)?);
        }
        Ok(docs)
    }

    /// Replace a document in place, keeping its position. Returns whether it existed.
    pub fn replace_document(&self, collection: &str, doc: &Value) -> Result<bool> {
        let id = doc_id_of(doc)
            .ok_or_else(|| Error::Storage("cannot replace a document without _id".into()))?;
        let json = serde_json::to_string(doc)?;
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE documents SET doc_json = ?1 WHERE collection = ?2 AND doc_id = ?3",
                params![json, collection, id],
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    /// Replace many documents in one transaction. Missing ids are skipped.
    pub fn replace_documents(&self, collection: &str, docs: &[Value]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let mut count = 0;
        for doc in docs {
            let Some(id) = doc_id_of(doc) else {
                continue;
            };
            count += Self::update_row(&tx, collection, &id, doc)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(count)
    }

    pub fn delete_documents(&self, collection: &str, ids: &[String]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let mut count = 0;
        {
            let mut stmt = tx
                .prepare_cached("DELETE FROM documents WHERE collection = ?1 AND doc_id = ?2")
                .map_err(db_err)?;
            for id in ids {
                count += stmt.execute(params![collection, id]).map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(count)
    }

    pub fn count_documents(&self, collection: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count)
    }

    // ---------------------------------------------------------------
    // Indexes
    // ---------------------------------------------------------------

    /// Create a secondary index over top-level document keys.
    pub fn create_index(&self, collection: &str, name: &str, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Err(Error::Storage(format!("index '{}' has no keys", name)));
        }
        let digest = Sha256::digest(format!("{}\0{}", collection, name).as_bytes());
        let sql_name = format!("idx_doc_{}", &hex::encode(digest)[..16]);
        let exprs: Vec<String> = keys
            .iter()
            .map(|k| format!("json_extract(doc_json, {})", json_path_literal(k)))
            .collect();
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON documents({}) WHERE collection = {}",
            sql_name,
            exprs.join(", "),
            sql_literal(collection)
        );
        let keys_json = serde_json::to_string(keys)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        Self::ensure_collection(&tx, collection)?;
        tx.execute_batch(&sql).map_err(db_err)?;
        tx.execute(
            "INSERT OR REPLACE INTO collection_indexes (collection, name, sql_name, keys_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![collection, name, sql_name, keys_json, now_millis()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        debug!("Created index {} on {} ({})", name, collection, keys.join(", "));
        Ok(())
    }

    pub fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT name, keys_json FROM collection_indexes WHERE collection = ?1 ORDER BY created_at, name",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;
        let mut indexes = Vec::new();
        for row in rows {
            let (name, keys_json) = row.map_err(db_err)?;
            indexes.push(IndexInfo {
                name,
                keys: serde_json::from_str(&keys_json)?,
            });
        }
        Ok(indexes)
    }

    // ---------------------------------------------------------------
    // Aggregation
    // ---------------------------------------------------------------

    /// Run `pipeline` over `collection`.
    ///
    /// Returns the output documents, or an empty vec when the pipeline ends
    /// in a sink (the output was committed to the sink's target instead).
    pub fn aggregate(&self, collection: &str, pipeline: &Pipeline) -> Result<Vec<Value>> {
        let (body, sink) = pipeline.split_sink()?;
        let docs = self.find_all(collection)?;
        let input_len = docs.len();
        let output = {
            let mut rng = self.rng.lock();
            run_stages(body, docs, &mut *rng)?
        };
        debug!(
            "Aggregated {} ({} stages): {} -> {} documents",
            collection,
            body.len(),
            input_len,
            output.len()
        );
        match sink {
            None => Ok(output),
            Some(sink) => {
                self.commit(sink, output)?;
                Ok(Vec::new())
            }
        }
    }

    /// Run a pipeline that ends in a sink and report what was written.
    pub fn execute(&self, collection: &str, pipeline: &Pipeline) -> Result<WriteReport> {
        let (body, sink) = pipeline.split_sink()?;
        let sink = sink.ok_or_else(|| {
            Error::Pipeline("execute() requires a pipeline ending in Out or Merge".into())
        })?;
        let docs = self.find_all(collection)?;
        let output = {
            let mut rng = self.rng.lock();
            run_stages(body, docs, &mut *rng)?
        };
        self.commit(sink, output)
    }

    fn commit(&self, sink: &Stage, docs: Vec<Value>) -> Result<WriteReport> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let report = match sink {
            Stage::Out(target) => Self::write_out(&tx, target, docs)?,
            Stage::Merge(merge) => Self::write_merge(&tx, merge, docs)?,
            _ => return Err(Error::Pipeline("not a sink stage".into())),
        };
        tx.commit().map_err(db_err)?;
        debug!(
            "Committed sink: inserted={}, merged={}, replaced={}, kept={}, discarded={}",
            report.inserted, report.merged, report.replaced, report.kept, report.discarded
        );
        Ok(report)
    }

    fn write_out(tx: &Transaction<'_>, target: &str, docs: Vec<Value>) -> Result<WriteReport> {
        Self::ensure_collection(tx, target)?;
        tx.execute(
            "DELETE FROM documents WHERE collection = ?1",
            params![target],
        )
        .map_err(db_err)?;
        let mut report = WriteReport::default();
        for mut doc in docs {
            let id = ensure_id(&mut doc)?;
            Self::insert_row(tx, target, &id, &doc)?;
            report.inserted += 1;
        }
        Ok(report)
    }

    fn write_merge(tx: &Transaction<'_>, merge: &MergeOptions, docs: Vec<Value>) -> Result<WriteReport> {
        Self::ensure_collection(tx, &merge.into)?;
        let mut report = WriteReport::default();
        for mut doc in docs {
            let id = ensure_id(&mut doc)?;
            let existing: Option<String> = tx
                .prepare_cached(
                    "SELECT doc_json FROM documents WHERE collection = ?1 AND doc_id = ?2",
                )
                .map_err(db_err)?
                .query_row(params![merge.into, id], |row| row.get(0))
                .optional()
                .map_err(db_err)?;

            match existing {
                None => match merge.when_not_matched {
                    WhenNotMatched::Insert => {
                        Self::insert_row(tx, &merge.into, &id, &doc)?;
                        report.inserted += 1;
                    }
                    WhenNotMatched::Discard => report.discarded += 1,
                },
                Some(json) => match merge.when_matched {
                    WhenMatched::KeepExisting => report.kept += 1,
                    WhenMatched::Replace => {
                        Self::update_row(tx, &merge.into, &id, &doc)?;
                        report.replaced += 1;
                    }
                    WhenMatched::Merge => {
                        let mut current: Value = serde_json::from_str(&json)?;
                        if let (Value::Object(current_map), Value::Object(incoming)) =
                            (&mut current, doc)
                        {
                            current_map.extend(incoming);
                        }
                        Self::update_row(tx, &merge.into, &id, &current)?;
                        report.merged += 1;
                    }
                },
            }
        }
        Ok(report)
    }

    fn ensure_collection(tx: &Transaction<'_>, name: &str) -> Result<()> {
        tx.execute(
            "INSERT OR IGNORE INTO collections (name, created_at) VALUES (?1, ?2)",
            params![name, now_millis()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn insert_row(tx: &Transaction<'_>, collection: &str, id: &str, doc: &Value) -> Result<()> {
        let json = serde_json::to_string(doc)?;
        tx.prepare_cached(
            "INSERT INTO documents (collection, doc_id, doc_json) VALUES (?1, ?2, ?3)",
        )
        .map_err(db_err)?
        .execute(params![collection, id, json])
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                Error::Storage(format!("duplicate _id '{}' in collection '{}'", id, collection))
            } else {
                db_err(e)
            }
        })?;
        Ok(())
    }

    fn update_row(tx: &Transaction<'_>, collection: &str, id: &str, doc: &Value) -> Result<usize> {
        let json = serde_json::to_string(doc)?;
        let count = tx
            .prepare_cached(
                "UPDATE documents SET doc_json = ?1 WHERE collection = ?2 AND doc_id = ?3",
            )
            .map_err(db_err)?
            .execute(params![json, collection, id])
            .map_err(db_err)?;
        Ok(count)
    }

    // ---------------------------------------------------------------
    // Dataset records
    // ---------------------------------------------------------------

    /// Insert or update a dataset record. `created_at` of an existing record is kept.
    pub fn save_dataset_record(&self, record: &DatasetRecord) -> Result<()> {
        let meta_json = serde_json::to_string(&record.meta)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO datasets (name, sample_collection, meta_json, created_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(name) DO UPDATE SET \
                sample_collection = excluded.sample_collection, \
                meta_json = excluded.meta_json, \
                updated_at = ?5",
            params![
                record.name,
                record.sample_collection,
                meta_json,
                record.created_at,
                now_millis()
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn load_dataset_record(&self, name: &str) -> Result<Option<DatasetRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .prepare_cached(
                "SELECT name, sample_collection, meta_json, created_at, updated_at \
                 FROM datasets WHERE name = ?1",
            )
            .map_err(db_err)?
            .query_row(params![name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            })
            .optional()
            .map_err(db_err)?;
        let Some((name, sample_collection, meta_json, created_at, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(DatasetRecord {
            name,
            sample_collection,
            meta: serde_json::from_str(&meta_json)?,
            created_at,
            updated_at,
        }))
    }

    pub fn delete_dataset_record(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute("DELETE FROM datasets WHERE name = ?1", params![name])
            .map_err(db_err)?;
        Ok(count > 0)
    }

    pub fn list_dataset_names(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT name FROM datasets ORDER BY name")
            .map_err(db_err)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(db_err)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ---------------------------------------------------------------
    // Stats
    // ---------------------------------------------------------------

    pub fn get_stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();
        let count = |sql: &str| -> Result<i64> {
            conn.query_row(sql, [], |row| row.get(0)).map_err(db_err)
        };
        Ok(StoreStats {
            total_collections: count("SELECT COUNT(*) FROM collections")?,
            total_documents: count("SELECT COUNT(*) FROM documents")?,
            total_datasets: count("SELECT COUNT(*) FROM datasets")?,
            db_path: self
                .db_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|| ":memory:".to_string()),
        })
    }
}
