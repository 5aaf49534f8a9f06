//! Patches views and syncing patch edits back to the source.
//!
//! A [`PatchesView`] reads from its own patches dataset. Label edits made
//! through it are written back to the source collection by element id;
//! `save()` additionally deletes from the source every element that is no
//! longer present among the patches.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::evaluation::{make_evaluation_patches_dataset, resolve_eval_fields};
use crate::extract::{make_patches_dataset, OtherFields};
use labelset_core::{Error, Result};
use labelset_dataset::{Dataset, DatasetView, Sample};
use labelset_store::{Expr, Stage};

/// How a patches view was derived from its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchesStage {
    ToPatches {
        field: String,
        other_fields: OtherFields,
        keep_label_lists: bool,
    },
    ToEvaluationPatches {
        eval_key: String,
        other_fields: OtherFields,
    },
}

impl PatchesStage {
    pub fn to_patches(field: impl Into<String>) -> Self {
        Self::ToPatches {
            field: field.into(),
            other_fields: OtherFields::None,
            keep_label_lists: false,
        }
    }

    pub fn to_evaluation_patches(eval_key: impl Into<String>) -> Self {
        Self::ToEvaluationPatches {
            eval_key: eval_key.into(),
            other_fields: OtherFields::None,
        }
    }

    pub fn with_other_fields(mut self, fields: OtherFields) -> Self {
        match &mut self {
            Self::ToPatches { other_fields, .. } | Self::ToEvaluationPatches { other_fields, .. } => {
                *other_fields = fields;
            }
        }
        self
    }

    /// Only meaningful for [`PatchesStage::ToPatches`].
    pub fn keep_label_lists(mut self, keep: bool) -> Self {
        if let Self::ToPatches {
            keep_label_lists, ..
        } = &mut self
        {
            *keep_label_lists = keep;
        }
        self
    }

    /// Materialize a fresh patches dataset for `source` and wrap it.
    pub fn load_view(&self, source: &DatasetView) -> Result<PatchesView> {
        let label_fields = self.label_fields(source)?;
        let dataset = self.make_dataset(source)?;
        Ok(PatchesView {
            source: source.clone(),
            stage: self.clone(),
            patches_dataset: Arc::new(RwLock::new(dataset)),
            label_fields,
            stages: Vec::new(),
        })
    }

    fn make_dataset(&self, source: &DatasetView) -> Result<Dataset> {
        match self {
            Self::ToPatches {
                field,
                other_fields,
                keep_label_lists,
            } => make_patches_dataset(source, field, other_fields, *keep_label_lists),
            Self::ToEvaluationPatches {
                eval_key,
                other_fields,
            } => make_evaluation_patches_dataset(source, eval_key, other_fields),
        }
    }

    /// Label fields that edits must be synced through, as named on `source`.
    fn label_fields(&self, source: &DatasetView) -> Result<Vec<String>> {
        match self {
            Self::ToPatches { field, .. } => Ok(vec![field.clone()]),
            Self::ToEvaluationPatches { eval_key, .. } => {
                let info = source.get_evaluation_info(eval_key)?;
                let (gt, pred) =
                    resolve_eval_fields(source, eval_key, &info.config.gt_field, &info.config.pred_field)?;
                Ok(vec![gt, pred])
            }
        }
    }
}

/// One patch of a [`PatchesView`]. Its id is the id of the label element it
/// was extracted from.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    sample: Sample,
}

impl Patch {
    pub fn id(&self) -> &str {
        self.sample.id()
    }

    /// Id of the source sample the element belongs to.
    pub fn sample_id(&self) -> Option<&str> {
        self.str_field("_sample_id")
    }

    /// Id of the source frame, for patches of a frames collection.
    pub fn frame_id(&self) -> Option<&str> {
        self.str_field("_frame_id")
    }

    pub fn frame_number(&self) -> Option<u64> {
        self.sample
            .as_value()
            .get("frame_number")
            .and_then(|v| v.as_u64())
    }

    /// `tp`, `fp` or `fn` on evaluation patches.
    pub fn patch_type(&self) -> Option<&str> {
        self.str_field("type")
    }

    pub fn iou(&self) -> Option<f64> {
        self.sample.as_value().get("iou").and_then(|v| v.as_f64())
    }

    pub fn crowd(&self) -> Option<bool> {
        self.sample.as_value().get("crowd").and_then(|v| v.as_bool())
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.sample.get(field)
    }

    pub fn label<L: DeserializeOwned>(&self, field: &str) -> Result<Option<L>> {
        self.sample.label(field)
    }

    pub fn set(&mut self, field: &str, value: Value) {
        self.sample.set(field, value);
    }

    pub fn set_label<L: Serialize>(&mut self, field: &str, label: &L) -> Result<()> {
        self.sample.set(field, serde_json::to_value(label)?);
        Ok(())
    }

    pub fn sample(&self) -> &Sample {
        &self.sample
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.sample.as_value().get(key).and_then(|v| v.as_str())
    }
}

/// A view of the patches extracted from a source collection.
///
/// Clones share the backing patches dataset, so a `reload()` through one
/// handle is seen by all of them. Stage builders return new views over the
/// same backing dataset.
#[derive(Debug, Clone)]
pub struct PatchesView {
    source: DatasetView,
    stage: PatchesStage,
    patches_dataset: Arc<RwLock<Dataset>>,
    label_fields: Vec<String>,
    stages: Vec<Stage>,
}

impl PatchesView {
    /// Patches of `field` over `source`.
    pub fn to_patches(source: &DatasetView, field: &str) -> Result<Self> {
        PatchesStage::to_patches(field).load_view(source)
    }

    /// TP/FP/FN patches of evaluation run `eval_key` over `source`.
    pub fn to_evaluation_patches(source: &DatasetView, eval_key: &str) -> Result<Self> {
        PatchesStage::to_evaluation_patches(eval_key).load_view(source)
    }

    pub fn name(&self) -> String {
        format!("{}-patches", self.source.dataset().name())
    }

    pub fn source(&self) -> &DatasetView {
        &self.source
    }

    pub fn patches_stage(&self) -> &PatchesStage {
        &self.stage
    }

    /// The backing patches dataset.
    pub fn patches_dataset(&self) -> Dataset {
        self.patches_dataset.read().clone()
    }

    pub fn label_fields(&self) -> &[String] {
        &self.label_fields
    }

    pub fn patches_field(&self) -> Option<&str> {
        match &self.stage {
            PatchesStage::ToPatches { field, .. } => Some(field),
            PatchesStage::ToEvaluationPatches { .. } => None,
        }
    }

    pub fn gt_field(&self) -> Option<&str> {
        match &self.stage {
            PatchesStage::ToEvaluationPatches { .. } => self.label_fields.first().map(String::as_str),
            PatchesStage::ToPatches { .. } => None,
        }
    }

    pub fn pred_field(&self) -> Option<&str> {
        match &self.stage {
            PatchesStage::ToEvaluationPatches { .. } => self.label_fields.get(1).map(String::as_str),
            PatchesStage::ToPatches { .. } => None,
        }
    }

    pub fn is_frames(&self) -> bool {
        self.source.is_frames()
    }

    /// Field on each patch identifying the source document labels are
    /// written to.
    fn id_field(&self) -> &'static str {
        if self.is_frames() {
            "frame_id"
        } else {
            "sample_id"
        }
    }

    /// The patches dataset with this view's stages applied.
    fn view(&self) -> Result<DatasetView> {
        let mut view = self.patches_dataset().view();
        for stage in &self.stages {
            view = view.with_stage(stage.clone())?;
        }
        Ok(view)
    }

    fn push(&self, stage: Stage) -> Self {
        let mut view = self.clone();
        view.stages.push(stage);
        view
    }

    // ---------------------------------------------------------------
    // Stages
    // ---------------------------------------------------------------

    pub fn match_expr(&self, expr: Expr) -> Self {
        self.push(Stage::Match(expr))
    }

    pub fn skip(&self, n: usize) -> Self {
        self.push(Stage::Skip(n))
    }

    pub fn limit(&self, n: usize) -> Self {
        self.push(Stage::Limit(n))
    }

    pub fn sort_by(&self, field: &str, ascending: bool) -> Self {
        self.push(Stage::Sort {
            field: labelset_dataset::to_db_path(field),
            ascending,
        })
    }

    pub fn select_ids<S: AsRef<str>>(&self, ids: &[S]) -> Self {
        self.push(Stage::Match(Expr::is_in(Expr::field("_id"), id_values(ids))))
    }

    pub fn exclude_ids<S: AsRef<str>>(&self, ids: &[S]) -> Self {
        self.push(Stage::Match(Expr::not(Expr::is_in(
            Expr::field("_id"),
            id_values(ids),
        ))))
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    pub fn patches(&self) -> Result<Vec<Patch>> {
        Ok(self
            .view()?
            .samples()?
            .into_iter()
            .map(|sample| Patch { sample })
            .collect())
    }

    pub fn first(&self) -> Result<Patch> {
        Ok(Patch {
            sample: self.view()?.first()?,
        })
    }

    /// The patch with the given id, if it is in this view.
    pub fn get(&self, id: &str) -> Result<Patch> {
        let sample = self
            .select_ids(&[id])
            .view()?
            .samples()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("patch '{}' in {}", id, self.name())))?;
        Ok(Patch { sample })
    }

    pub fn values(&self, path: &str) -> Result<Vec<Value>> {
        self.view()?.values(path)
    }

    pub fn count(&self) -> Result<usize> {
        self.view()?.count()
    }

    pub fn ids(&self) -> Result<Vec<String>> {
        self.view()?.ids()
    }

    /// Every patch taken from the given source sample, via the `sample_id`
    /// index.
    pub fn patches_for_sample(&self, sample_id: &str) -> Result<Vec<Patch>> {
        Ok(self
            .patches_dataset()
            .find_by_field("sample_id", &Value::String(sample_id.to_string()))?
            .into_iter()
            .map(|sample| Patch { sample })
            .collect())
    }

    // ---------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------

    /// Set `field` on each patch of this view, in view order. Edits to the
    /// label fields are synced to the source.
    pub fn set_values(&self, field: &str, values: Vec<Value>) -> Result<()> {
        let root = field.split('.').next().unwrap_or(field);
        let must_sync = self.label_fields.iter().any(|f| f == root);

        // Setting values can change which patches this view selects
        let ids = if must_sync && !self.stages.is_empty() {
            Some(self.ids()?)
        } else {
            None
        };

        self.view()?.set_values(field, values)?;

        if must_sync {
            self.sync_source_field(root, ids.as_deref())?;
        }
        Ok(())
    }

    /// Persist an edited patch and sync its label fields to the source.
    pub fn save_patch(&self, patch: &Patch) -> Result<()> {
        self.patches_dataset().save_sample(&patch.sample)?;
        self.sync_source_patch(patch)
    }

    /// Write this view into the patches dataset, then overwrite the source
    /// labels with the patches' contents.
    ///
    /// Patches excluded by the view's stages are deleted, and so are the
    /// corresponding elements in the source. With `fields`, only those
    /// fields are saved and only the label fields among them are synced.
    pub fn save(&self, fields: Option<&[String]>) -> Result<()> {
        self.view()?.save(fields)?;

        let sync_fields: Vec<String> = match fields {
            None => self.label_fields.clone(),
            Some(fields) => fields
                .iter()
                .filter(|f| self.label_fields.contains(f))
                .cloned()
                .collect(),
        };

        // The view may no longer describe the saved contents (e.g. after a
        // skip), so sync from the patches dataset itself
        for field in &sync_fields {
            self.sync_source_root_field(field)?;
        }
        Ok(())
    }

    /// Regenerate the patches dataset from the current source contents.
    pub fn reload(&self) -> Result<()> {
        self.source.reload()?;
        let fresh = self.stage.make_dataset(&self.source)?;
        let stale = std::mem::replace(&mut *self.patches_dataset.write(), fresh);
        stale.delete()?;
        debug!("Reloaded {}", self.name());
        Ok(())
    }

    /// Drop the backing patches dataset.
    pub fn delete(self) -> Result<()> {
        self.patches_dataset().delete()
    }

    // ---------------------------------------------------------------
    // Source sync
    // ---------------------------------------------------------------

    fn sync_source_patch(&self, patch: &Patch) -> Result<()> {
        let patches = self.patches_dataset();
        let target_id = patch
            .get(self.id_field())
            .ok_or_else(|| Error::Schema(format!("patch '{}' has no {}", patch.id(), self.id_field())))?;

        for field in &self.label_fields {
            let label_type = patches.get_label_field_type(field)?;
            let mut doc = patch.get(field).unwrap_or(Value::Null);
            if let Some(list_field) = label_type.list_field() {
                doc = doc.get(list_field).cloned().unwrap_or(Value::Null);
            }
            self.source
                .set_labels(field, std::slice::from_ref(&target_id), &[doc])?;
        }
        Ok(())
    }

    /// Push the current `field` content of the given patches (or all
    /// patches) to the source.
    fn sync_source_field(&self, field: &str, ids: Option<&[String]>) -> Result<()> {
        let patches = self.patches_dataset();
        let (_, label_path) = patches.get_label_field_path(field, None)?;
        let view = match ids {
            Some(ids) => patches.view().select_ids(ids),
            None => patches.view(),
        };

        let target_ids = view.values(self.id_field())?;
        let docs = view.values(&label_path)?;
        let written = self.source.set_labels(field, &target_ids, &docs)?;
        debug!("Synced {} {} labels to {}", written, field, self.source.dataset().name());
        Ok(())
    }

    /// Make the source's `field` match the patches dataset: update every
    /// element present among the patches, delete every other element of the
    /// source view.
    fn sync_source_root_field(&self, field: &str) -> Result<()> {
        let patches = self.patches_dataset();
        let (_, label_id_path) = patches.get_label_field_path(field, Some("id"))?;
        let label_path = label_id_path
            .rsplit_once('.')
            .map(|(parent, _)| parent.to_string())
            .unwrap_or_else(|| field.to_string());

        let all = patches.view();
        let target_ids = all.values(self.id_field())?;
        let docs = all.values(&label_path)?;
        let label_ids: HashSet<String> = all
            .values_unwind(&label_id_path)?
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();

        let written = self.source.set_labels(field, &target_ids, &docs)?;

        let (_, src_id_path) = self.source.get_label_field_path(field, Some("id"))?;
        let delete_ids: HashSet<String> = self
            .source
            .values_unwind(&src_id_path)?
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .filter(|id| !label_ids.contains(id))
            .collect();

        let deleted = if delete_ids.is_empty() {
            0
        } else {
            self.source.delete_labels(&delete_ids, field)?
        };
        info!(
            "Saved {} to {}.{}: {} labels written, {} deleted",
            self.name(),
            self.source.dataset().name(),
            field,
            written,
            deleted
        );
        Ok(())
    }
}

fn id_values<S: AsRef<str>>(ids: &[S]) -> Vec<Value> {
    ids.iter()
        .map(|id| Value::String(id.as_ref().to_string()))
        .collect()
}
