//! Datasets: named sample collections with a field schema and an
//! evaluation run registry.
//!
//! A `Dataset` is a cheap, cloneable handle. Clones share the store and the
//! in-memory schema, so a field added through one handle is visible through
//! all of them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::evaluation::{EvaluationConfig, EvaluationInfo};
use crate::sample::Sample;
use crate::schema::{default_fields, to_db_path, FieldDef, FieldKind, FRAMES_PREFIX};
use crate::view::DatasetView;
use labelset_core::{Error, LabelType, Result};
use labelset_store::path::{get_path, set_path};
use labelset_store::{DatasetRecord, DocumentStore, Expr, IndexInfo, Pipeline, Projection, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

/// Options for [`Dataset::create_with`].
#[derive(Debug, Clone, Copy)]
pub struct DatasetOptions {
    pub media_type: MediaType,
    /// Samples are frames flattened out of a video dataset.
    pub frames: bool,
    /// Ephemeral dataset backing a patches view.
    pub patches: bool,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            media_type: MediaType::Image,
            frames: false,
            patches: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatasetMeta {
    media_type: MediaType,
    #[serde(default)]
    frames: bool,
    #[serde(default)]
    patches: bool,
    fields: Vec<FieldDef>,
    #[serde(default)]
    evaluations: BTreeMap<String, EvaluationInfo>,
}

#[derive(Clone)]
pub struct Dataset {
    store: Arc<DocumentStore>,
    name: String,
    sample_collection: String,
    created_at: i64,
    meta: Arc<RwLock<DatasetMeta>>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("sample_collection", &self.sample_collection)
            .finish()
    }
}

impl Dataset {
    /// Create an empty image dataset.
    pub fn create(store: Arc<DocumentStore>, name: &str) -> Result<Self> {
        Self::create_with(store, name, DatasetOptions::default())
    }

    pub fn create_with(store: Arc<DocumentStore>, name: &str, opts: DatasetOptions) -> Result<Self> {
        if store.load_dataset_record(name)?.is_some() {
            return Err(Error::Config(format!("Dataset '{}' already exists", name)));
        }

        let mut fields = default_fields();
        if opts.frames {
            fields.push(FieldDef::new("sample_id", FieldKind::Id));
            fields.push(FieldDef::new("frame_number", FieldKind::FrameNumber));
        }

        let sample_collection = format!("samples.{}", name);
        store.drop_collection(&sample_collection)?;
        store.create_collection(&sample_collection)?;

        let dataset = Self {
            store,
            name: name.to_string(),
            sample_collection,
            created_at: chrono::Utc::now().timestamp_millis(),
            meta: Arc::new(RwLock::new(DatasetMeta {
                media_type: opts.media_type,
                frames: opts.frames,
                patches: opts.patches,
                fields,
                evaluations: BTreeMap::new(),
            })),
        };
        dataset.persist()?;
        if opts.frames {
            dataset.create_index("sample_id")?;
        }
        debug!("Created dataset {}", name);
        Ok(dataset)
    }

    /// Load an existing dataset by name.
    pub fn load(store: Arc<DocumentStore>, name: &str) -> Result<Self> {
        let record = store
            .load_dataset_record(name)?
            .ok_or_else(|| Error::NotFound(format!("dataset '{}'", name)))?;
        let meta: DatasetMeta = serde_json::from_value(record.meta)?;
        Ok(Self {
            store,
            name: record.name,
            sample_collection: record.sample_collection,
            created_at: record.created_at,
            meta: Arc::new(RwLock::new(meta)),
        })
    }

    fn persist(&self) -> Result<()> {
        let meta = serde_json::to_value(&*self.meta.read())?;
        self.store.save_dataset_record(&DatasetRecord {
            name: self.name.clone(),
            sample_collection: self.sample_collection.clone(),
            meta,
            created_at: self.created_at,
            updated_at: None,
        })
    }

    /// Re-read schema and evaluation runs from the store.
    pub fn reload(&self) -> Result<()> {
        let record = self
            .store
            .load_dataset_record(&self.name)?
            .ok_or_else(|| Error::NotFound(format!("dataset '{}'", self.name)))?;
        *self.meta.write() = serde_json::from_value(record.meta)?;
        Ok(())
    }

    /// Delete the dataset's samples and its record.
    pub fn delete(&self) -> Result<()> {
        self.store.drop_collection(&self.sample_collection)?;
        self.store.delete_dataset_record(&self.name)?;
        info!("Deleted dataset {}", self.name);
        Ok(())
    }

    pub fn exists(&self) -> Result<bool> {
        Ok(self.store.load_dataset_record(&self.name)?.is_some())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sample_collection(&self) -> &str {
        &self.sample_collection
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn media_type(&self) -> MediaType {
        self.meta.read().media_type
    }

    pub fn is_frames(&self) -> bool {
        self.meta.read().frames
    }

    pub fn is_patches(&self) -> bool {
        self.meta.read().patches
    }

    pub fn view(&self) -> DatasetView {
        DatasetView::new(self.clone())
    }

    // ---------------------------------------------------------------
    // Schema
    // ---------------------------------------------------------------

    /// Fields in display order.
    pub fn field_schema(&self) -> Vec<FieldDef> {
        self.meta.read().fields.clone()
    }

    pub fn get_field(&self, name: &str) -> Option<FieldDef> {
        self.meta.read().fields.iter().find(|f| f.name == name).cloned()
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.get_field(name).is_some()
    }

    /// Declare a field. Redeclaring with the same kind is a no-op.
    pub fn add_sample_field(&self, name: &str, kind: FieldKind) -> Result<()> {
        {
            let mut meta = self.meta.write();
            if let Some(existing) = meta.fields.iter().find(|f| f.name == name) {
                if existing.kind == kind {
                    return Ok(());
                }
                return Err(Error::Schema(format!(
                    "Field '{}' already exists with kind {:?}",
                    name, existing.kind
                )));
            }
            if name.starts_with(FRAMES_PREFIX) && meta.media_type != MediaType::Video {
                return Err(Error::Schema(format!(
                    "Frame field '{}' requires a video dataset",
                    name
                )));
            }
            meta.fields.push(FieldDef::new(name, kind));
        }
        self.persist()
    }

    /// Reorder the schema so `leading` fields come first, in that order.
    pub fn reorder_fields(&self, leading: &[&str]) -> Result<()> {
        {
            let mut meta = self.meta.write();
            let mut ordered: Vec<FieldDef> = leading
                .iter()
                .filter_map(|name| meta.fields.iter().find(|f| f.name == *name).cloned())
                .collect();
            ordered.extend(
                meta.fields
                    .iter()
                    .filter(|f| !leading.contains(&f.name.as_str()))
                    .cloned(),
            );
            meta.fields = ordered;
        }
        self.persist()
    }

    /// Whether `field` lives at the frame level of a video dataset.
    pub fn is_frame_field(&self, field: &str) -> bool {
        self.media_type() == MediaType::Video && field.starts_with(FRAMES_PREFIX)
    }

    pub fn get_label_field_type(&self, field: &str) -> Result<LabelType> {
        let def = self
            .get_field(field)
            .ok_or_else(|| Error::Schema(format!("Dataset '{}' has no field '{}'", self.name, field)))?;
        def.kind.label_type().ok_or_else(|| {
            Error::Schema(format!(
                "Field '{}' is not a label field ({:?})",
                field, def.kind
            ))
        })
    }

    /// Storage path of a label field's content, optionally extended by a
    /// per-element subfield. For list types the path points into the
    /// element array (`gt.detections`, `gt.detections._id`).
    pub fn get_label_field_path(&self, field: &str, subfield: Option<&str>) -> Result<(LabelType, String)> {
        let label_type = self.get_label_field_type(field)?;
        let mut path = to_db_path(field);
        if let Some(list_field) = label_type.list_field() {
            path.push('.');
            path.push_str(list_field);
        }
        if let Some(sub) = subfield {
            path.push('.');
            path.push_str(&to_db_path(sub));
        }
        Ok((label_type, path))
    }

    fn expand_schema(&self, doc: &Value) -> Result<()> {
        let Value::Object(map) = doc else {
            return Ok(());
        };
        let mut added = Vec::new();
        {
            let mut meta = self.meta.write();
            let mut consider = |name: String, value: &Value, meta: &mut DatasetMeta| {
                if meta.fields.iter().any(|f| f.name == name) {
                    return;
                }
                if let Some(kind) = FieldKind::infer(value) {
                    added.push(name.clone());
                    meta.fields.push(FieldDef::new(name, kind));
                }
            };
            for (key, value) in map {
                match key.as_str() {
                    "_id" | "_media_type" | "_rand" => continue,
                    "frames" if meta.media_type == MediaType::Video => {
                        for frame in value.as_array().into_iter().flatten() {
                            for (fkey, fvalue) in frame.as_object().into_iter().flatten() {
                                if fkey == "_id" || fkey == "frame_number" {
                                    continue;
                                }
                                consider(format!("{}{}", FRAMES_PREFIX, fkey), fvalue, &mut *meta);
                            }
                        }
                    }
                    _ => {
                        let name = match key.as_str() {
                            "_sample_id" => "sample_id".to_string(),
                            "_frame_id" => "frame_id".to_string(),
                            other => other.to_string(),
                        };
                        consider(name, value, &mut *meta);
                    }
                }
            }
        }
        if !added.is_empty() {
            debug!("Dataset {}: added fields {:?}", self.name, added);
            self.persist()?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Samples
    // ---------------------------------------------------------------

    pub fn add_sample(&self, sample: Sample) -> Result<String> {
        let ids = self.add_samples(vec![sample])?;
        ids.into_iter()
            .next()
            .ok_or_else(|| Error::Internal("add_samples returned no id".into()))
    }

    /// Insert samples, expanding the schema with any new fields.
    pub fn add_samples(&self, samples: Vec<Sample>) -> Result<Vec<String>> {
        let media_type = self.media_type();
        let mut docs = Vec::with_capacity(samples.len());
        for mut sample in samples {
            if sample.as_value().get("_media_type").is_none() {
                set_path(sample.doc_mut(), "_media_type", Value::from(media_type.as_str()));
            }
            self.expand_schema(sample.as_value())?;
            docs.push(sample.into_value());
        }
        self.store.insert_documents(&self.sample_collection, docs)
    }

    pub fn get_sample(&self, id: &str) -> Result<Option<Sample>> {
        self.store
            .get_document(&self.sample_collection, id)?
            .map(Sample::from_doc)
            .transpose()
    }

    pub fn samples(&self) -> Result<Vec<Sample>> {
        self.store
            .find_all(&self.sample_collection)?
            .into_iter()
            .map(Sample::from_doc)
            .collect()
    }

    /// Persist an edited sample in place.
    pub fn save_sample(&self, sample: &Sample) -> Result<()> {
        self.expand_schema(sample.as_value())?;
        if !self.store.replace_document(&self.sample_collection, sample.as_value())? {
            return Err(Error::NotFound(format!(
                "sample '{}' in dataset '{}'",
                sample.id(),
                self.name
            )));
        }
        Ok(())
    }

    pub fn delete_samples(&self, ids: &[String]) -> Result<usize> {
        self.store.delete_documents(&self.sample_collection, ids)
    }

    pub fn count(&self) -> Result<i64> {
        self.store.count_documents(&self.sample_collection)
    }

    /// Value of `path` for every sample, in insertion order.
    pub fn values(&self, path: &str) -> Result<Vec<Value>> {
        self.view().values(path)
    }

    /// Run a pipeline over this dataset's samples.
    pub fn aggregate(&self, pipeline: &Pipeline) -> Result<Vec<Value>> {
        self.store.aggregate(&self.sample_collection, pipeline)
    }

    /// Samples whose top-level `field` equals `value` (index-served when
    /// the field is indexed).
    pub fn find_by_field(&self, field: &str, value: &Value) -> Result<Vec<Sample>> {
        self.store
            .find_by_field(&self.sample_collection, &to_db_path(field), value)?
            .into_iter()
            .map(Sample::from_doc)
            .collect()
    }

    // ---------------------------------------------------------------
    // Indexes
    // ---------------------------------------------------------------

    /// Index a single field; the index is named after the field.
    pub fn create_index(&self, field: &str) -> Result<()> {
        let key = to_db_path(field);
        self.store
            .create_index(&self.sample_collection, field, &[key.as_str()])
    }

    /// Compound index, named `<key>_1_<key>_1...` after its storage keys.
    pub fn create_compound_index(&self, fields: &[&str]) -> Result<String> {
        let keys: Vec<String> = fields.iter().map(|f| to_db_path(f)).collect();
        let name = keys
            .iter()
            .map(|k| format!("{}_1", k))
            .collect::<Vec<_>>()
            .join("_");
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.store
            .create_index(&self.sample_collection, &name, &key_refs)?;
        Ok(name)
    }

    pub fn list_indexes(&self) -> Result<Vec<IndexInfo>> {
        self.store.list_indexes(&self.sample_collection)
    }

    // ---------------------------------------------------------------
    // Label mutation
    // ---------------------------------------------------------------

    /// Replace label content on the samples with the given ids.
    ///
    /// For list fields each doc is one element or an array of elements;
    /// every element replaces the element with the same `_id` in that
    /// sample's list. Elements with no counterpart are ignored. For singular
    /// fields the doc replaces the field value. Returns the number of labels
    /// written.
    pub fn set_labels(&self, field: &str, ids: &[Value], docs: &[Value]) -> Result<usize> {
        if ids.len() != docs.len() {
            return Err(Error::Internal(format!(
                "set_labels: {} ids but {} docs",
                ids.len(),
                docs.len()
            )));
        }
        let label_type = self.get_label_field_type(field)?;
        let root = to_db_path(field);

        // Group updates per sample, preserving first-seen order
        let mut order: Vec<String> = Vec::new();
        let mut updates: HashMap<String, Vec<Value>> = HashMap::new();
        for (id, doc) in ids.iter().zip(docs) {
            let Some(id) = id.as_str() else {
                continue;
            };
            let elements: Vec<Value> = match doc {
                Value::Null => continue,
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            if elements.is_empty() {
                continue;
            }
            updates
                .entry(id.to_string())
                .or_insert_with(|| {
                    order.push(id.to_string());
                    Vec::new()
                })
                .extend(elements);
        }

        let mut written = 0;
        let mut changed = Vec::new();
        for id in order {
            let Some(mut doc) = self.store.get_document(&self.sample_collection, &id)? else {
                debug!("set_labels: sample {} no longer exists", id);
                continue;
            };
            let elements = updates.remove(&id).unwrap_or_default();
            match label_type.list_field() {
                Some(list_field) => {
                    let path = format!("{}.{}", root, list_field);
                    let Some(Value::Array(mut current)) = get_path(&doc, &path) else {
                        continue;
                    };
                    for element in elements {
                        let element_id = element.get("_id").cloned();
                        if let Some(slot) = current
                            .iter_mut()
                            .find(|e| element_id.is_some() && e.get("_id") == element_id.as_ref())
                        {
                            *slot = element;
                            written += 1;
                        }
                    }
                    set_path(&mut doc, &path, Value::Array(current));
                }
                None => {
                    if let Some(last) = elements.into_iter().last() {
                        set_path(&mut doc, &root, last);
                        written += 1;
                    }
                }
            }
            changed.push(doc);
        }
        self.store
            .replace_documents(&self.sample_collection, &changed)?;
        debug!("set_labels({}) on {}: {} labels written", field, self.name, written);
        Ok(written)
    }

    /// Remove label elements by their own ids from every sample. Returns
    /// the number of labels removed.
    pub fn delete_labels(&self, ids: &HashSet<String>, field: &str) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let label_type = self.get_label_field_type(field)?;
        let root = to_db_path(field);

        let mut removed = 0;
        let mut changed = Vec::new();
        for mut doc in self.store.find_all(&self.sample_collection)? {
            match label_type.list_field() {
                Some(list_field) => {
                    let path = format!("{}.{}", root, list_field);
                    let Some(Value::Array(current)) = get_path(&doc, &path) else {
                        continue;
                    };
                    let before = current.len();
                    let kept: Vec<Value> = current
                        .into_iter()
                        .filter(|e| {
                            e.get("_id")
                                .and_then(|v| v.as_str())
                                .map(|id| !ids.contains(id))
                                .unwrap_or(true)
                        })
                        .collect();
                    if kept.len() != before {
                        removed += before - kept.len();
                        set_path(&mut doc, &path, Value::Array(kept));
                        changed.push(doc);
                    }
                }
                None => {
                    let label_id = get_path(&doc, &format!("{}._id", root));
                    if let Some(Value::String(label_id)) = label_id {
                        if ids.contains(&label_id) {
                            set_path(&mut doc, &root, Value::Null);
                            removed += 1;
                            changed.push(doc);
                        }
                    }
                }
            }
        }
        self.store
            .replace_documents(&self.sample_collection, &changed)?;
        info!("Deleted {} labels from {}.{}", removed, self.name, field);
        Ok(removed)
    }

    // ---------------------------------------------------------------
    // Views
    // ---------------------------------------------------------------

    /// Make this dataset match the contents of `view`.
    ///
    /// Samples excluded by the view are deleted. With `fields`, only those
    /// top-level fields are written on the remaining samples; otherwise
    /// each sample is replaced by its view version.
    pub fn save_view(&self, view: &DatasetView, fields: Option<&[String]>) -> Result<()> {
        if view.stages().is_empty() && fields.is_none() {
            return Ok(());
        }

        let keep: HashSet<String> = view.ids()?.into_iter().collect();
        let delete: Vec<String> = self
            .view()
            .ids()?
            .into_iter()
            .filter(|id| !keep.contains(id))
            .collect();

        let mut pipeline = view.pipeline();
        let when_matched = match fields {
            Some(fields) => {
                pipeline = pipeline.project(
                    true,
                    fields.iter().map(|f| (to_db_path(f), Projection::Include)),
                );
                labelset_store::WhenMatched::Merge
            }
            None => labelset_store::WhenMatched::Replace,
        };
        let pipeline = pipeline.merge(
            self.sample_collection.clone(),
            when_matched,
            labelset_store::WhenNotMatched::Discard,
        );
        let report = self.store.execute(&self.sample_collection, &pipeline)?;
        let deleted = self.delete_samples(&delete)?;
        info!(
            "Saved view on {}: {} samples written, {} deleted",
            self.name,
            report.merged + report.replaced,
            deleted
        );
        Ok(())
    }

    // ---------------------------------------------------------------
    // Evaluations
    // ---------------------------------------------------------------

    pub fn register_evaluation(&self, key: &str, config: EvaluationConfig) -> Result<EvaluationInfo> {
        for field in [&config.gt_field, &config.pred_field] {
            if !self.has_field(field) {
                return Err(Error::Schema(format!(
                    "Evaluation '{}' references unknown field '{}'",
                    key, field
                )));
            }
        }
        let info = EvaluationInfo {
            key: key.to_string(),
            config,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.meta
            .write()
            .evaluations
            .insert(key.to_string(), info.clone());
        self.persist()?;
        Ok(info)
    }

    pub fn get_evaluation_info(&self, key: &str) -> Result<EvaluationInfo> {
        self.meta
            .read()
            .evaluations
            .get(key)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("evaluation '{}' on dataset '{}'", key, self.name))
            })
    }

    pub fn list_evaluations(&self) -> Vec<String> {
        self.meta.read().evaluations.keys().cloned().collect()
    }

    pub fn delete_evaluation(&self, key: &str) -> Result<bool> {
        let removed = self.meta.write().evaluations.remove(key).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    // ---------------------------------------------------------------
    // Frames
    // ---------------------------------------------------------------

    /// Flatten a video dataset into a new frames dataset with one sample per
    /// frame. Frame samples keep their frame ids and carry `sample_id` and
    /// `frame_number`; evaluation runs are copied with their `frames.`
    /// field names intact.
    pub fn to_frames(&self, name: &str) -> Result<Dataset> {
        if self.media_type() != MediaType::Video {
            return Err(Error::Config(format!(
                "to_frames() requires a video dataset; '{}' contains {} samples",
                self.name,
                self.media_type().as_str()
            )));
        }

        let frames = Dataset::create_with(
            self.store.clone(),
            name,
            DatasetOptions {
                media_type: MediaType::Image,
                frames: true,
                patches: false,
            },
        )?;

        {
            let src = self.meta.read();
            let mut meta = frames.meta.write();
            for def in &src.fields {
                if let Some(stripped) = def.name.strip_prefix(FRAMES_PREFIX) {
                    if !meta.fields.iter().any(|f| f.name == stripped) {
                        meta.fields.push(FieldDef::new(stripped, def.kind.clone()));
                    }
                }
            }
            meta.evaluations = src.evaluations.clone();
        }
        frames.persist()?;
        frames.create_compound_index(&["sample_id", "frame_number"])?;

        let pipeline = Pipeline::new()
            .project(
                true,
                [
                    ("filepath", Projection::Include),
                    ("tags", Projection::Include),
                    ("metadata", Projection::Include),
                    ("frames", Projection::Include),
                ],
            )
            .unwind("frames")
            .then(Stage::ReplaceRoot(Expr::MergeObjects(vec![
                Expr::field("frames"),
                Expr::object([
                    ("_sample_id", Expr::field("_id")),
                    ("filepath", Expr::field("filepath")),
                    ("tags", Expr::field("tags")),
                    ("metadata", Expr::field("metadata")),
                    ("_media_type", Expr::lit(MediaType::Image.as_str())),
                ]),
            ])))
            .out(frames.sample_collection.clone());
        self.aggregate(&pipeline)?;

        info!(
            "Flattened {} into frames dataset {} ({} frames)",
            self.name,
            name,
            frames.count()?
        );
        Ok(frames)
    }
}
