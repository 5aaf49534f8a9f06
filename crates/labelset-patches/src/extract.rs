//! Patch extraction: one derived sample per label element.

use std::sync::Arc;

use tracing::{info, warn};

use crate::materialize::Materializer;
use labelset_core::{generate_id, singular_type_of, Error, LabelType, Result};
use labelset_dataset::{to_db_path, Dataset, DatasetOptions, DatasetView, FieldKind, MediaType};
use labelset_store::{DocumentStore, Expr, Pipeline, Projection, Stage, WriteReport};

/// Which non-default source fields are copied onto each patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OtherFields {
    #[default]
    None,
    Fields(Vec<String>),
    /// Every source field the patches dataset does not already define.
    All,
}

impl OtherFields {
    pub fn fields<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self::Fields(fields.into_iter().map(Into::into).collect())
    }
}

/// Build the extraction plan for `field` over `source`.
///
/// The plan is the source view's stages followed by: a projection onto the
/// patch fields, an unwind of the element list, a `_rand` draw, `_id` taken
/// from the element, and the element (or a one-element list when
/// `keep_label_lists`) stored back under the field. Nothing executes here.
pub fn make_patches_pipeline(
    source: &DatasetView,
    field: &str,
    other_fields: &[String],
    keep_label_lists: bool,
) -> Result<Pipeline> {
    if source.dataset().is_frame_field(field) {
        return Err(Error::Config(format!(
            "Frame label patches cannot be extracted from '{}' directly; \
             convert the video dataset to frames via to_frames() first",
            field
        )));
    }

    let label_type = source.get_label_field_type(field)?;
    if !label_type.supports_patches() {
        // Surfaces the list of supported types
        singular_type_of(label_type)?;
    }
    let (_, list_path) = source.get_label_field_path(field, None)?;

    let mut project: Vec<(String, Projection)> = vec![
        ("_media_type".into(), Projection::Include),
        ("filepath".into(), Projection::Include),
        ("metadata".into(), Projection::Include),
        ("tags".into(), Projection::Include),
        (format!("{}._cls", field), Projection::Include),
        (list_path.clone(), Projection::Include),
    ];
    project.extend(
        other_fields
            .iter()
            .map(|f| (to_db_path(f), Projection::Include)),
    );
    if source.is_frames() {
        project.push(("_sample_id".into(), Projection::Include));
        project.push(("_frame_id".into(), Projection::Computed(Expr::field("_id"))));
        project.push(("frame_number".into(), Projection::Include));
    } else {
        project.push(("_sample_id".into(), Projection::Computed(Expr::field("_id"))));
    }

    let element = Expr::field(list_path.clone());
    let pipeline = source
        .pipeline()
        .project(false, project)
        .unwind(list_path.clone())
        .set("_rand", Expr::Rand)
        .set("_id", Expr::field(format!("{}._id", list_path)));

    let pipeline = if keep_label_lists {
        pipeline.set(list_path, Expr::Array(vec![element]))
    } else {
        pipeline.set(field, element)
    };
    Ok(pipeline)
}

/// Create and populate a patches dataset for `field` of `source`.
pub fn make_patches_dataset(
    source: &DatasetView,
    field: &str,
    other_fields: &OtherFields,
    keep_label_lists: bool,
) -> Result<Dataset> {
    if source.dataset().is_frame_field(field) {
        return Err(Error::Config(format!(
            "Frame label patches cannot be extracted from '{}' directly; \
             convert the video dataset to frames via to_frames() first",
            field
        )));
    }

    let field_type = if keep_label_lists {
        source.get_label_field_type(field)?
    } else {
        singular_type_of(source.get_label_field_type(field)?)?
    };

    let dataset = create_patches_dataset(source.dataset().store())?;
    let report = discard_on_error(
        &dataset,
        populate_patches(&dataset, source, field, field_type, other_fields, keep_label_lists),
    )?;
    info!(
        "Extracted {} patches from {}.{} ({})",
        report.inserted,
        source.dataset().name(),
        field,
        field_type
    );
    Ok(dataset)
}

fn populate_patches(
    dataset: &Dataset,
    source: &DatasetView,
    field: &str,
    field_type: LabelType,
    other_fields: &OtherFields,
    keep_label_lists: bool,
) -> Result<WriteReport> {
    let is_frames = source.is_frames();
    add_source_id_fields(dataset, is_frames)?;
    dataset.add_sample_field(field, FieldKind::label(field_type))?;
    let other_fields = merge_other_fields(dataset, source.dataset(), other_fields)?;
    make_pretty_summary(dataset, is_frames)?;

    let plan = make_patches_pipeline(source, field, &other_fields, keep_label_lists)?;
    Materializer::new(dataset).overwrite(source.dataset(), plan)
}

/// Delete a patches dataset whose build failed before passing the error on,
/// so no half-built `_patches.*` dataset outlives the call.
pub(crate) fn discard_on_error<T>(dataset: &Dataset, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        warn!("Discarding partially built {}: {}", dataset.name(), err);
        if let Err(cleanup) = dataset.delete() {
            warn!("Failed to delete {}: {}", dataset.name(), cleanup);
        }
    }
    result
}

/// Fresh, empty patches dataset with a private name.
pub(crate) fn create_patches_dataset(store: &Arc<DocumentStore>) -> Result<Dataset> {
    Dataset::create_with(
        store.clone(),
        &format!("_patches.{}", generate_id()),
        DatasetOptions {
            media_type: MediaType::Image,
            frames: false,
            patches: true,
        },
    )
}

/// `sample_id` (and for frame sources `frame_id`/`frame_number`) with
/// their indexes.
pub(crate) fn add_source_id_fields(dataset: &Dataset, is_frames: bool) -> Result<()> {
    dataset.add_sample_field("sample_id", FieldKind::Id)?;
    dataset.create_index("sample_id")?;
    if is_frames {
        dataset.add_sample_field("frame_id", FieldKind::Id)?;
        dataset.add_sample_field("frame_number", FieldKind::FrameNumber)?;
        dataset.create_index("frame_id")?;
        dataset.create_compound_index(&["sample_id", "frame_number"])?;
    }
    Ok(())
}

/// Copy the schema of the requested source fields onto `dataset` and
/// return the fields the extraction plan must carry over.
pub(crate) fn merge_other_fields(
    dataset: &Dataset,
    source: &Dataset,
    other_fields: &OtherFields,
) -> Result<Vec<String>> {
    let requested: Vec<String> = match other_fields {
        OtherFields::None => return Ok(Vec::new()),
        OtherFields::Fields(fields) => fields.clone(),
        OtherFields::All => source
            .field_schema()
            .into_iter()
            .map(|f| f.name)
            .filter(|name| !dataset.has_field(name))
            .collect(),
    };

    for name in &requested {
        if dataset.has_field(name) {
            continue;
        }
        if let Some(def) = source.get_field(name) {
            dataset.add_sample_field(&def.name, def.kind)?;
        }
    }
    Ok(requested)
}

/// Put the identifying fields first in the patches schema.
pub(crate) fn make_pretty_summary(dataset: &Dataset, is_frames: bool) -> Result<()> {
    let leading: &[&str] = if is_frames {
        &["id", "sample_id", "frame_id", "filepath", "frame_number"]
    } else {
        &["id", "sample_id", "filepath"]
    };
    dataset.reorder_fields(leading)
}

/// Unwraps `field` from its singular element form into a one-element list
/// of `list_type`.
pub(crate) fn upgrade_labels(field: &str, list_type: LabelType) -> Result<Stage> {
    let list_field = labelset_core::list_field_name(list_type)?;
    Ok(Stage::Set(vec![(
        field.to_string(),
        Expr::object([
            ("_cls", Expr::lit(list_type.name())),
            (list_field, Expr::Array(vec![Expr::field(field)])),
        ]),
    )]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelset_core::{Detection, Detections, Polyline, Polylines};
    use labelset_dataset::Sample;
    use serde_json::json;

    fn source() -> Dataset {
        let store = Arc::new(DocumentStore::open_in_memory(Some(11)).unwrap());
        let ds = Dataset::create(store, "src").unwrap();
        ds.add_sample(
            Sample::new("a.jpg")
                .with_label(
                    "gt",
                    &Detections::new(vec![
                        Detection::new("cat", [0.1, 0.1, 0.2, 0.2]),
                        Detection::new("dog", [0.5, 0.5, 0.2, 0.2]),
                    ]),
                )
                .unwrap()
                .with_value("weather", "rain"),
        )
        .unwrap();
        ds.add_sample(
            Sample::new("b.jpg")
                .with_label("gt", &Detections::new(vec![]))
                .unwrap(),
        )
        .unwrap();
        ds
    }

    #[test]
    fn test_failed_extraction_leaves_no_dataset() {
        let store = Arc::new(DocumentStore::open_in_memory(Some(11)).unwrap());
        let ds = Dataset::create(store.clone(), "dup").unwrap();
        let shared = Detection::new("cat", [0.1, 0.1, 0.2, 0.2]);
        for path in ["a.jpg", "b.jpg"] {
            ds.add_sample(
                Sample::new(path)
                    .with_label("gt", &Detections::new(vec![shared.clone()]))
                    .unwrap(),
            )
            .unwrap();
        }

        let result = make_patches_dataset(&ds.view(), "gt", &OtherFields::None, false);
        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(store.list_dataset_names().unwrap(), vec!["dup".to_string()]);
    }

    #[test]
    fn test_pipeline_shape() {
        let ds = source();
        let view = ds.view().limit(5);
        let plan = make_patches_pipeline(&view, "gt", &[], false).unwrap();
        let stages = plan.stages();
        assert_eq!(stages.len(), 6);
        assert_eq!(stages[0], Stage::Limit(5));
        assert!(matches!(&stages[1], Stage::Project { include_id: false, .. }));
        assert_eq!(stages[2], Stage::Unwind("gt.detections".into()));
        assert_eq!(stages[3], Stage::Set(vec![("_rand".into(), Expr::Rand)]));
        assert_eq!(
            stages[4],
            Stage::Set(vec![("_id".into(), Expr::field("gt.detections._id"))])
        );
        assert_eq!(
            stages[5],
            Stage::Set(vec![("gt".into(), Expr::field("gt.detections"))])
        );
    }

    #[test]
    fn test_patch_records() {
        let ds = source();
        let patches = make_patches_dataset(&ds.view(), "gt", &OtherFields::None, false).unwrap();
        assert!(patches.is_patches());
        assert_eq!(patches.count().unwrap(), 2);
        assert_eq!(patches.get_label_field_type("gt").unwrap(), LabelType::Detection);

        let src_ids = ds.view().values_unwind("gt.detections.id").unwrap();
        assert_eq!(patches.view().values("id").unwrap(), src_ids);

        let first = patches.samples().unwrap().remove(0);
        let sample_id = ds.view().first().unwrap().id().to_string();
        assert_eq!(first.get("sample_id"), Some(json!(sample_id)));
        assert_eq!(first.get("gt.label"), Some(json!("cat")));
        assert_eq!(first.get("gt._cls"), Some(json!("Detection")));
        assert!(first.get("weather").is_none());
        assert!(first.get("_rand").unwrap().is_f64());

        let names: Vec<String> = patches.field_schema().into_iter().map(|f| f.name).collect();
        assert_eq!(&names[..3], &["id", "sample_id", "filepath"]);
    }

    #[test]
    fn test_keep_label_lists_and_other_fields() {
        let ds = source();
        let patches = make_patches_dataset(&ds.view(), "gt", &OtherFields::All, true).unwrap();
        assert_eq!(patches.get_label_field_type("gt").unwrap(), LabelType::Detections);
        assert!(patches.has_field("weather"));

        let first = patches.samples().unwrap().remove(0);
        assert_eq!(first.get("gt._cls"), Some(json!("Detections")));
        assert_eq!(first.get("gt.detections.label"), Some(json!(["cat"])));
        assert_eq!(first.get("weather"), Some(json!("rain")));
    }

    #[test]
    fn test_polylines() {
        let store = Arc::new(DocumentStore::open_in_memory(Some(2)).unwrap());
        let ds = Dataset::create(store, "poly").unwrap();
        let line = Polyline::new("road", vec![vec![[0.0, 0.0], [1.0, 1.0]]]).closed();
        ds.add_sample(
            Sample::new("a.jpg")
                .with_label("lanes", &Polylines::new(vec![line.clone()]))
                .unwrap(),
        )
        .unwrap();
        let patches =
            make_patches_dataset(&ds.view(), "lanes", &OtherFields::fields(["filepath"]), false)
                .unwrap();
        let patch = patches.samples().unwrap().remove(0);
        assert_eq!(patch.id(), line.id);
        let back: Polyline = patch.label("lanes").unwrap().unwrap();
        assert_eq!(back, line);
    }

    #[test]
    fn test_unsupported_and_frame_fields() {
        let ds = source();
        ds.add_sample_field(
            "cls",
            FieldKind::label(LabelType::Classifications),
        )
        .unwrap();
        assert!(matches!(
            make_patches_pipeline(&ds.view(), "cls", &[], false),
            Err(Error::UnsupportedLabelType(_))
        ));
        assert!(matches!(
            make_patches_dataset(&ds.view(), "weather", &OtherFields::None, false),
            Err(Error::Schema(_))
        ));

        let video = Dataset::create_with(
            ds.store().clone(),
            "video",
            DatasetOptions {
                media_type: MediaType::Video,
                ..Default::default()
            },
        )
        .unwrap();
        video
            .add_sample_field("frames.gt", FieldKind::label(LabelType::Detections))
            .unwrap();
        assert!(matches!(
            make_patches_dataset(&video.view(), "frames.gt", &OtherFields::None, false),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_upgrade_labels_stage() {
        let stage = upgrade_labels("gt", LabelType::Detections).unwrap();
        let Stage::Set(assignments) = stage else {
            panic!("expected a Set stage");
        };
        assert_eq!(assignments[0].0, "gt");
        assert!(upgrade_labels("gt", LabelType::Detection).is_err());
    }
}
