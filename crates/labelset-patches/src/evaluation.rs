//! Evaluation patches: one sample per true positive, false positive and
//! false negative of an evaluation run.
//!
//! Ground-truth patches are written first. Predictions matched to a
//! ground-truth element are then merged into that element's patch (several
//! predictions can share one crowd object), and unmatched predictions are
//! added as patches of their own.

use tracing::{debug, info};

use crate::extract::{
    add_source_id_fields, create_patches_dataset, discard_on_error, make_patches_pipeline,
    make_pretty_summary, merge_other_fields, upgrade_labels, OtherFields,
};
use crate::materialize::Materializer;
use labelset_core::{list_field_name, Error, LabelType, Result};
use labelset_dataset::evaluation::NO_MATCH_ID;
use labelset_dataset::{Dataset, DatasetView, FieldKind, FRAMES_PREFIX};
use labelset_store::{Accumulator, Expr, Pipeline, Projection, Stage, WriteReport};

/// Steps of an [`EvaluationAssembly`], in the order they must run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyStage {
    GroundTruth,
    MergeMatched,
    Unmatched,
}

impl AssemblyStage {
    pub const ORDER: [AssemblyStage; 3] = [Self::GroundTruth, Self::MergeMatched, Self::Unmatched];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyReport {
    pub ground_truth: WriteReport,
    pub matched: WriteReport,
    pub unmatched: WriteReport,
}

/// Builds an evaluation patches dataset in three ordered writes.
///
/// Each stage commits on its own. The assembly is not atomic: if a stage
/// fails, the earlier stages' records stay in the target and the target
/// should be discarded.
pub struct EvaluationAssembly<'a> {
    source: &'a DatasetView,
    target: &'a Dataset,
    eval_key: String,
    gt_field: String,
    pred_field: String,
    crowd_attr: Option<String>,
    other_fields: Vec<String>,
    completed: Vec<AssemblyStage>,
    report: AssemblyReport,
}

impl<'a> EvaluationAssembly<'a> {
    pub fn new(
        source: &'a DatasetView,
        target: &'a Dataset,
        eval_key: &str,
        gt_field: &str,
        pred_field: &str,
        crowd_attr: Option<&str>,
        other_fields: Vec<String>,
    ) -> Self {
        Self {
            source,
            target,
            eval_key: eval_key.to_string(),
            gt_field: gt_field.to_string(),
            pred_field: pred_field.to_string(),
            crowd_attr: crowd_attr.map(str::to_string),
            other_fields,
            completed: Vec::new(),
            report: AssemblyReport::default(),
        }
    }

    pub fn completed(&self) -> &[AssemblyStage] {
        &self.completed
    }

    pub fn next_stage(&self) -> Option<AssemblyStage> {
        AssemblyStage::ORDER.get(self.completed.len()).copied()
    }

    /// Run the next pending stage.
    pub fn run_next(&mut self) -> Result<Option<AssemblyStage>> {
        let Some(stage) = self.next_stage() else {
            return Ok(None);
        };
        let materializer = Materializer::new(self.target);
        let source = self.source.dataset();
        match stage {
            AssemblyStage::GroundTruth => {
                let plan = self.eval_plan(&self.gt_field, false, self.crowd_attr.as_deref())?;
                self.report.ground_truth = materializer.overwrite(source, plan)?;
            }
            AssemblyStage::MergeMatched => {
                let plan = self.merge_matched_plan()?;
                self.report.matched = materializer.merge_into(source, plan)?;
            }
            AssemblyStage::Unmatched => {
                let plan = self.eval_plan(&self.pred_field, true, None)?;
                self.report.unmatched = materializer.upsert(source, plan)?;
            }
        }
        debug!("Evaluation assembly '{}': {:?} done", self.eval_key, stage);
        self.completed.push(stage);
        Ok(Some(stage))
    }

    /// Run every remaining stage.
    pub fn run(mut self) -> Result<AssemblyReport> {
        while self.run_next()?.is_some() {}
        Ok(self.report)
    }

    /// Patches of `field` tagged with their evaluation outcome and wrapped
    /// back into list form.
    fn eval_plan(&self, field: &str, skip_matched: bool, crowd_attr: Option<&str>) -> Result<Pipeline> {
        let eval_type = format!("{}.{}", field, self.eval_key);
        let eval_id = format!("{}.{}_id", field, self.eval_key);
        let eval_iou = format!("{}.{}_iou", field, self.eval_key);

        let mut plan = make_patches_pipeline(self.source, field, &self.other_fields, false)?;

        if skip_matched {
            plan = plan.matching(Expr::Or(vec![
                Expr::eq(Expr::field(eval_id.clone()), Expr::lit(NO_MATCH_ID)),
                Expr::not(Expr::exists(Expr::field(eval_id))),
            ]));
        }

        plan = plan.then(Stage::Set(vec![
            ("type".into(), Expr::field(eval_type)),
            ("iou".into(), Expr::field(eval_iou)),
        ]));

        if let Some(attr) = crowd_attr {
            plan = plan.set("crowd", crowd_expr(field, attr));
        }

        let list_type = self.source.get_label_field_type(field)?;
        Ok(plan.then(upgrade_labels(field, list_type)?))
    }

    /// Matched predictions grouped under the id of the ground-truth element
    /// they matched.
    fn merge_matched_plan(&self) -> Result<Pipeline> {
        let field = &self.pred_field;
        let list_type = self.source.get_label_field_type(field)?;
        let list_field = list_field_name(list_type)?;
        let list_path = format!("{}.{}", field, list_field);
        let eval_field = format!("{}.{}_id", list_path, self.eval_key);

        Ok(self
            .source
            .pipeline()
            .project(true, [(list_path.clone(), Projection::Include)])
            .unwind(list_path.clone())
            .matching(Expr::And(vec![
                Expr::exists(Expr::field(eval_field.clone())),
                Expr::ne(Expr::field(eval_field.clone()), Expr::lit(NO_MATCH_ID)),
            ]))
            .then(Stage::Group {
                key: Expr::field(eval_field),
                accumulators: vec![("_labels".into(), Accumulator::Push, Expr::field(list_path))],
            })
            .project(
                true,
                [(
                    field.clone(),
                    Projection::Computed(Expr::object([
                        ("_cls", Expr::lit(list_type.name())),
                        (list_field, Expr::field("_labels")),
                    ])),
                )],
            ))
    }
}

/// Crowd flag of a singular label: its own `<attr>`, else the legacy
/// `attributes.<attr>.value`, else null.
fn crowd_expr(field: &str, attr: &str) -> Expr {
    let direct = Expr::field(format!("{}.{}", field, attr));
    let legacy = Expr::field(format!("{}.attributes.{}.value", field, attr));
    Expr::cond(
        Expr::exists(direct.clone()),
        Expr::to_bool(direct),
        Expr::cond(
            Expr::exists(legacy.clone()),
            Expr::to_bool(legacy),
            Expr::null(),
        ),
    )
}

/// Create and populate the evaluation patches dataset for `eval_key`.
///
/// Every patch carries `type` (`tp`, `fp` or `fn`) and `iou`. The
/// predicted field is only present on patches holding at least one
/// prediction: false negatives have no predicted field at all rather than
/// an empty list, and false positives likewise lack the ground-truth field.
/// If any step fails the partially built dataset is deleted.
pub fn make_evaluation_patches_dataset(
    source: &DatasetView,
    eval_key: &str,
    other_fields: &OtherFields,
) -> Result<Dataset> {
    let info = source.get_evaluation_info(eval_key)?;
    let crowd_attr = info.config.iscrowd.clone();
    let (gt_field, pred_field) =
        resolve_eval_fields(source, eval_key, &info.config.gt_field, &info.config.pred_field)?;

    let gt_type = source.get_label_field_type(&gt_field)?;
    let pred_type = source.get_label_field_type(&pred_field)?;
    for (field, label_type) in [(&gt_field, gt_type), (&pred_field, pred_type)] {
        if !label_type.supports_patches() {
            return Err(Error::UnsupportedLabelType(format!(
                "{} of evaluation field '{}'",
                label_type, field
            )));
        }
    }

    let dataset = create_patches_dataset(source.dataset().store())?;
    let report = discard_on_error(
        &dataset,
        populate_evaluation_patches(
            &dataset,
            source,
            eval_key,
            (gt_field.as_str(), gt_type),
            (pred_field.as_str(), pred_type),
            crowd_attr.as_deref(),
            other_fields,
        ),
    )?;

    info!(
        "Built evaluation patches for '{}' on {}: {} ground truth, {} merged, {} unmatched predictions",
        eval_key,
        source.dataset().name(),
        report.ground_truth.inserted,
        report.matched.merged,
        report.unmatched.inserted
    );
    Ok(dataset)
}

fn populate_evaluation_patches(
    dataset: &Dataset,
    source: &DatasetView,
    eval_key: &str,
    (gt_field, gt_type): (&str, LabelType),
    (pred_field, pred_type): (&str, LabelType),
    crowd_attr: Option<&str>,
    other_fields: &OtherFields,
) -> Result<AssemblyReport> {
    let is_frames = source.is_frames();
    add_source_id_fields(dataset, is_frames)?;
    dataset.add_sample_field(gt_field, FieldKind::label(gt_type))?;
    dataset.add_sample_field(pred_field, FieldKind::label(pred_type))?;
    if crowd_attr.is_some() {
        dataset.add_sample_field("crowd", FieldKind::Bool)?;
    }
    dataset.add_sample_field("type", FieldKind::String)?;
    dataset.add_sample_field("iou", FieldKind::Float)?;
    let other_fields = merge_other_fields(dataset, source.dataset(), other_fields)?;
    make_pretty_summary(dataset, is_frames)?;

    EvaluationAssembly::new(
        source,
        dataset,
        eval_key,
        gt_field,
        pred_field,
        crowd_attr,
        other_fields,
    )
    .run()
}

/// Evaluation fields as seen by `source`. On frames views both fields lose
/// their `frames.` prefix; the run must have been a frame-level one.
pub(crate) fn resolve_eval_fields(
    source: &DatasetView,
    eval_key: &str,
    gt_field: &str,
    pred_field: &str,
) -> Result<(String, String)> {
    if source.is_frames() {
        let pred = pred_field.strip_prefix(FRAMES_PREFIX).ok_or_else(|| {
            Error::Config(format!(
                "Cannot extract evaluation patches for sample-level evaluation '{}' from a frames view",
                eval_key
            ))
        })?;
        let gt = gt_field.strip_prefix(FRAMES_PREFIX).unwrap_or(gt_field);
        return Ok((gt.to_string(), pred.to_string()));
    }
    if source.dataset().is_frame_field(pred_field) {
        return Err(Error::Config(format!(
            "Frame evaluation patches for '{}' cannot be extracted directly; \
             convert the video dataset to frames via to_frames() first",
            eval_key
        )));
    }
    Ok((gt_field.to_string(), pred_field.to_string()))
}
