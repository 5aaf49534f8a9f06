//! Dataset views: a dataset plus a chain of read-only stages.

use std::collections::HashSet;

use serde_json::Value;

use crate::dataset::Dataset;
use crate::evaluation::EvaluationInfo;
use crate::sample::Sample;
use crate::schema::to_db_path;
use labelset_core::{Error, LabelType, Result};
use labelset_store::path::{get_path, unwind_values};
use labelset_store::{Expr, Pipeline, Stage};

#[derive(Debug, Clone)]
pub struct DatasetView {
    dataset: Dataset,
    stages: Vec<Stage>,
}

impl DatasetView {
    pub fn new(dataset: Dataset) -> Self {
        Self {
            dataset,
            stages: Vec::new(),
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// A new view with `stage` appended. Sinks are not view stages.
    pub fn with_stage(&self, stage: Stage) -> Result<Self> {
        if stage.is_sink() {
            return Err(Error::Pipeline("views cannot contain Out/Merge stages".into()));
        }
        let mut view = self.clone();
        view.stages.push(stage);
        Ok(view)
    }

    fn push(&self, stage: Stage) -> Self {
        let mut view = self.clone();
        view.stages.push(stage);
        view
    }

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
            field: to_db_path(field),
            ascending,
        })
    }

    pub fn select_ids<S: AsRef<str>>(&self, ids: &[S]) -> Self {
        self.match_expr(Expr::is_in(Expr::field("_id"), id_values(ids)))
    }

    pub fn exclude_ids<S: AsRef<str>>(&self, ids: &[S]) -> Self {
        self.match_expr(Expr::not(Expr::is_in(Expr::field("_id"), id_values(ids))))
    }

    /// The view's stages as a pipeline over the dataset's collection.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::from_stages(self.stages.clone())
    }

    /// Run the view followed by `extra`.
    pub fn aggregate(&self, extra: Pipeline) -> Result<Vec<Value>> {
        self.dataset.aggregate(&self.pipeline().extend(extra))
    }

    fn docs(&self) -> Result<Vec<Value>> {
        self.dataset.aggregate(&self.pipeline())
    }

    /// Value of `path` for each sample, in view order. Missing values are
    /// reported as null.
    pub fn values(&self, path: &str) -> Result<Vec<Value>> {
        let db_path = to_db_path(path);
        Ok(self
            .docs()?
            .iter()
            .map(|doc| get_path(doc, &db_path).unwrap_or(Value::Null))
            .collect())
    }

    /// Like [`values`](Self::values), with list results flattened and
    /// nulls dropped.
    pub fn values_unwind(&self, path: &str) -> Result<Vec<Value>> {
        Ok(unwind_values(self.values(path)?))
    }

    pub fn ids(&self) -> Result<Vec<String>> {
        Ok(self
            .values("id")?
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.docs()?.len())
    }

    pub fn samples(&self) -> Result<Vec<Sample>> {
        self.docs()?.into_iter().map(Sample::from_doc).collect()
    }

    pub fn first(&self) -> Result<Sample> {
        self.limit(1)
            .samples()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("view into '{}' is empty", self.dataset.name())))
    }

    /// Write one value per sample of the view, in view order. Null values
    /// clear the field.
    pub fn set_values(&self, field: &str, values: Vec<Value>) -> Result<()> {
        let ids = self.ids()?;
        if ids.len() != values.len() {
            return Err(Error::Internal(format!(
                "set_values({}): view has {} samples but {} values were given",
                field,
                ids.len(),
                values.len()
            )));
        }
        let mut samples = Vec::with_capacity(ids.len());
        for (id, value) in ids.iter().zip(values) {
            let mut sample = self
                .dataset
                .get_sample(id)?
                .ok_or_else(|| Error::NotFound(format!("sample '{}'", id)))?;
            sample.try_set(field, value)?;
            samples.push(sample);
        }
        for sample in &samples {
            self.dataset.save_sample(sample)?;
        }
        Ok(())
    }

    /// Make the underlying dataset match this view.
    pub fn save(&self, fields: Option<&[String]>) -> Result<()> {
        self.dataset.save_view(self, fields)
    }

    pub fn reload(&self) -> Result<()> {
        self.dataset.reload()
    }

    pub fn is_frames(&self) -> bool {
        self.dataset.is_frames()
    }

    pub fn get_label_field_type(&self, field: &str) -> Result<LabelType> {
        self.dataset.get_label_field_type(field)
    }

    pub fn get_label_field_path(&self, field: &str, subfield: Option<&str>) -> Result<(LabelType, String)> {
        self.dataset.get_label_field_path(field, subfield)
    }

    pub fn get_evaluation_info(&self, key: &str) -> Result<EvaluationInfo> {
        self.dataset.get_evaluation_info(key)
    }

    pub fn set_labels(&self, field: &str, ids: &[Value], docs: &[Value]) -> Result<usize> {
        self.dataset.set_labels(field, ids, docs)
    }

    pub fn delete_labels(&self, ids: &HashSet<String>, field: &str) -> Result<usize> {
        self.dataset.delete_labels(ids, field)
    }
}

fn id_values<S: AsRef<str>>(ids: &[S]) -> Vec<Value> {
    ids.iter()
        .map(|id| Value::String(id.as_ref().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelset_store::DocumentStore;
    use serde_json::json;
    use std::sync::Arc;

    fn dataset_with(n: usize) -> Dataset {
        let store = Arc::new(DocumentStore::open_in_memory(Some(3)).unwrap());
        let ds = Dataset::create(store, "ds").unwrap();
        for i in 0..n {
            ds.add_sample(Sample::new(format!("{}.jpg", i)).with_value("rank", i as i64))
                .unwrap();
        }
        ds
    }

    #[test]
    fn test_stages_and_values() {
        let ds = dataset_with(5);
        let view = ds
            .view()
            .match_expr(Expr::gt(Expr::field("rank"), Expr::lit(0)))
            .sort_by("rank", false)
            .skip(1)
            .limit(2);
        assert_eq!(view.values("rank").unwrap(), vec![json!(3), json!(2)]);
        assert_eq!(view.count().unwrap(), 2);
        assert_eq!(ds.count().unwrap(), 5);
        assert_eq!(view.first().unwrap().get("rank"), Some(json!(3)));
    }

    #[test]
    fn test_select_and_exclude_ids() {
        let ds = dataset_with(3);
        let ids = ds.view().ids().unwrap();
        assert_eq!(ds.view().select_ids(&ids[..1]).ids().unwrap(), vec![ids[0].clone()]);
        assert_eq!(ds.view().exclude_ids(&ids[..1]).count().unwrap(), 2);
        assert!(matches!(
            ds.view().select_ids::<&str>(&[]).first(),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_set_values_follows_view_order() {
        let ds = dataset_with(3);
        let view = ds.view().sort_by("rank", false);
        view.set_values("label", vec![json!("c"), json!("b"), json!("a")])
            .unwrap();
        let labels = ds.view().sort_by("rank", true).values("label").unwrap();
        assert_eq!(labels, vec![json!("a"), json!("b"), json!("c")]);
        assert!(matches!(
            view.set_values("label", vec![json!(1)]),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_set_values_through_label_lists() {
        let store = Arc::new(DocumentStore::open_in_memory(Some(3)).unwrap());
        let ds = Dataset::create(store, "ds").unwrap();
        let gt = json!({"_cls": "Detections", "detections": [
            {"_id": "d1", "_cls": "Detection", "label": "cat"},
            {"_id": "d2", "_cls": "Detection", "label": "dog"},
        ]});
        ds.add_sample(Sample::new("a.jpg").with_value("gt", gt)).unwrap();

        let view = ds.view();
        view.set_values("gt.detections.label", vec![json!(["lion", "wolf"])])
            .unwrap();
        assert_eq!(view.values("gt.detections.id").unwrap(), vec![json!(["d1", "d2"])]);
        assert_eq!(
            view.values("gt.detections.label").unwrap(),
            vec![json!(["lion", "wolf"])]
        );

        // One label per element is required
        assert!(matches!(
            view.set_values("gt.detections.label", vec![json!(["tiger"])]),
            Err(Error::Schema(_))
        ));
        assert_eq!(
            view.values("gt.detections.label").unwrap(),
            vec![json!(["lion", "wolf"])]
        );
    }

    #[test]
    fn test_save_view_deletes_and_merges() {
        let ds = dataset_with(4);
        let view = ds
            .view()
            .match_expr(Expr::gt(Expr::field("rank"), Expr::lit(1)));
        view.save(None).unwrap();
        assert_eq!(ds.count().unwrap(), 2);
        assert_eq!(
            ds.view().sort_by("rank", true).values("rank").unwrap(),
            vec![json!(2), json!(3)]
        );
    }

    #[test]
    fn test_with_stage_rejects_sinks() {
        let ds = dataset_with(1);
        assert!(matches!(
            ds.view().with_stage(Stage::Out("x".into())),
            Err(Error::Pipeline(_))
        ));
        assert!(ds.view().with_stage(Stage::Limit(1)).is_ok());
    }
}
