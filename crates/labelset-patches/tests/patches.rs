use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use labelset_core::{Detection, Detections, Error, LabelType, LabelsetConfig};
use labelset_dataset::evaluation::NO_MATCH_ID;
use labelset_dataset::{Dataset, DatasetOptions, EvaluationConfig, MediaType, Sample};
use labelset_patches::{OtherFields, PatchesStage, PatchesView};
use labelset_store::{DocumentStore, Expr};

fn memory_store() -> Arc<DocumentStore> {
    Arc::new(DocumentStore::open_in_memory(Some(7)).unwrap())
}

fn det(label: &str) -> Detection {
    Detection::new(label, [0.2, 0.2, 0.4, 0.4])
}

fn string_set(values: Vec<Value>) -> HashSet<String> {
    values
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// Three samples evaluated under "eval":
/// - s1: gt {g1 (crowd), g2}, pred {p1 -> g1, p2 -> g1, p3 -> g2}
/// - s2: gt {g3}, pred {p4 unmatched}
/// - s3: gt {}, pred {p5 unmatched}
/// G = 3, P = 5, M = 3, g = 2
fn evaluated_dataset(store: Arc<DocumentStore>) -> (Dataset, Vec<String>) {
    let ds = Dataset::create(store, "coco").unwrap();

    let g1 = det("person").with_attr("iscrowd", true);
    let g2 = det("person");
    let g3 = det("car");
    let p1 = det("person");
    let p2 = det("person");
    let p3 = det("person");
    let p4 = det("truck");
    let p5 = det("bus");
    let ids: Vec<String> = [&g1, &g2, &g3, &p1, &p2, &p3, &p4, &p5]
        .iter()
        .map(|d| d.id.clone())
        .collect();

    let s1 = Sample::new("s1.jpg")
        .with_label(
            "ground_truth",
            &Detections::new(vec![
                g1.with_eval("eval", "tp", &ids[3], Some(0.8)),
                g2.with_eval("eval", "tp", &ids[5], Some(0.7)),
            ]),
        )
        .unwrap()
        .with_label(
            "predictions",
            &Detections::new(vec![
                p1.with_eval("eval", "tp", &ids[0], Some(0.8)),
                p2.with_eval("eval", "tp", &ids[0], Some(0.6)),
                p3.with_eval("eval", "tp", &ids[1], Some(0.7)),
            ]),
        )
        .unwrap();
    let s2 = Sample::new("s2.jpg")
        .with_label(
            "ground_truth",
            &Detections::new(vec![g3.with_eval("eval", "fn", NO_MATCH_ID, None)]),
        )
        .unwrap()
        .with_label(
            "predictions",
            &Detections::new(vec![p4.with_eval("eval", "fp", NO_MATCH_ID, None)]),
        )
        .unwrap();
    let s3 = Sample::new("s3.jpg")
        .with_label("ground_truth", &Detections::new(vec![]))
        .unwrap()
        .with_label(
            "predictions",
            &Detections::new(vec![p5.with_eval("eval", "fp", NO_MATCH_ID, None)]),
        )
        .unwrap();
    ds.add_samples(vec![s1, s2, s3]).unwrap();
    ds.register_evaluation(
        "eval",
        EvaluationConfig::new("ground_truth", "predictions").with_crowd_attr("iscrowd"),
    )
    .unwrap();
    (ds, ids)
}

#[test]
fn test_patch_count_and_identity() {
    let (ds, _) = evaluated_dataset(memory_store());
    let patches = PatchesView::to_patches(&ds.view(), "predictions").unwrap();

    let src_ids = ds.view().values_unwind("predictions.detections.id").unwrap();
    assert_eq!(patches.count().unwrap(), src_ids.len());
    let patch_ids: HashSet<String> = patches.ids().unwrap().into_iter().collect();
    assert_eq!(string_set(src_ids), patch_ids);

    for patch in patches.patches().unwrap() {
        let sample = ds.get_sample(patch.sample_id().unwrap()).unwrap().unwrap();
        let element_ids = match sample.get("predictions.detections.id") {
            Some(Value::Array(ids)) => string_set(ids),
            other => panic!("unexpected element ids {:?}", other),
        };
        assert!(element_ids.contains(patch.id()));
    }
}

#[test]
fn test_patches_of_filtered_source_view() {
    let (ds, _) = evaluated_dataset(memory_store());
    let source = ds
        .view()
        .match_expr(Expr::eq(Expr::field("filepath"), Expr::lit("s1.jpg")));
    let patches = PatchesView::to_patches(&source, "predictions").unwrap();
    assert_eq!(patches.count().unwrap(), 3);
    assert!(patches
        .values("filepath")
        .unwrap()
        .iter()
        .all(|v| v == &json!("s1.jpg")));
}

#[test]
fn test_round_trip_edit() {
    let (ds, ids) = evaluated_dataset(memory_store());
    let patches = PatchesView::to_patches(&ds.view(), "ground_truth").unwrap();

    let mut patch = patches.get(&ids[2]).unwrap();
    let mut label: Detection = patch.label("ground_truth").unwrap().unwrap();
    label.label = Some("van".into());
    label.confidence = Some(0.5);
    patch.set_label("ground_truth", &label).unwrap();
    patches.save_patch(&patch).unwrap();

    let sample = ds.get_sample(patch.sample_id().unwrap()).unwrap().unwrap();
    let dets: Detections = sample.label("ground_truth").unwrap().unwrap();
    assert_eq!(dets.detections.len(), 1);
    assert_eq!(dets.detections[0], label);
}

#[test]
fn test_view_save_pushes_patch_edits() {
    let (ds, ids) = evaluated_dataset(memory_store());
    let patches = PatchesView::to_patches(&ds.view(), "predictions").unwrap();

    // Written straight to the patches dataset, so nothing is synced yet
    let mut patch = patches.get(&ids[6]).unwrap();
    patch.set("predictions.label", json!("lorry"));
    patches.patches_dataset().save_sample(patch.sample()).unwrap();
    let sample_id = patch.sample_id().unwrap().to_string();
    let labels = |ds: &Dataset| ds.get_sample(&sample_id).unwrap().unwrap().get("predictions.detections.label");
    assert_eq!(labels(&ds), Some(json!(["truck"])));

    patches.save(None).unwrap();
    assert_eq!(labels(&ds), Some(json!(["lorry"])));
    assert_eq!(
        ds.view().values_unwind("predictions.detections.id").unwrap().len(),
        5
    );
}

#[test]
fn test_list_field_edit_on_evaluation_patches() {
    let (ds, ids) = evaluated_dataset(memory_store());
    let patches = PatchesView::to_evaluation_patches(&ds.view(), "eval").unwrap();

    patches
        .select_ids(&[&ids[1]])
        .set_values("ground_truth.detections.label", vec![json!(["cyclist"])])
        .unwrap();

    let patch = patches.get(&ids[1]).unwrap();
    assert_eq!(patch.get("ground_truth._cls"), Some(json!("Detections")));
    assert_eq!(patch.get("ground_truth.detections.id"), Some(json!([ids[1]])));
    assert_eq!(patch.get("ground_truth.detections.label"), Some(json!(["cyclist"])));
    assert_eq!(
        ds.view().values_unwind("ground_truth.detections.label").unwrap(),
        vec![json!("person"), json!("cyclist"), json!("car")]
    );

    patches.save(None).unwrap();
    let gt = string_set(ds.view().values_unwind("ground_truth.detections.id").unwrap());
    assert_eq!(gt, string_set(vec![json!(ids[0]), json!(ids[1]), json!(ids[2])]));
    assert_eq!(
        ds.view().values_unwind("ground_truth.detections.label").unwrap(),
        vec![json!("person"), json!("cyclist"), json!("car")]
    );

    // A scalar cannot stand in for a list of labels
    assert!(matches!(
        patches
            .select_ids(&[&ids[1]])
            .set_values("ground_truth.detections.label", vec![json!("bike")]),
        Err(Error::Schema(_))
    ));
}

#[test]
fn test_patches_deleted_from_dataset_are_deleted_on_save() {
    let (ds, ids) = evaluated_dataset(memory_store());
    let patches = PatchesView::to_patches(&ds.view(), "predictions").unwrap();

    let removed = patches
        .patches_dataset()
        .delete_samples(&[ids[3].clone()])
        .unwrap();
    assert_eq!(removed, 1);
    // Deleting a patch alone leaves the source as it was
    assert_eq!(
        ds.view().values_unwind("predictions.detections.id").unwrap().len(),
        5
    );

    patches.save(None).unwrap();
    let pred = string_set(ds.view().values_unwind("predictions.detections.id").unwrap());
    assert_eq!(pred.len(), 4);
    assert!(!pred.contains(&ids[3]));
    assert_eq!(patches.count().unwrap(), 4);
}

#[test]
fn test_deletion_law() {
    let (ds, ids) = evaluated_dataset(memory_store());
    let patches = PatchesView::to_patches(&ds.view(), "predictions").unwrap();

    let before = string_set(ds.view().values_unwind("predictions.detections.id").unwrap());
    let dropped: HashSet<String> = [ids[4].clone(), ids[7].clone()].into_iter().collect();
    patches.exclude_ids(&[&ids[4], &ids[7]]).save(None).unwrap();

    let after = string_set(ds.view().values_unwind("predictions.detections.id").unwrap());
    let expected: HashSet<String> = before.difference(&dropped).cloned().collect();
    assert_eq!(after, expected);
    // Other fields of the source are untouched
    assert_eq!(
        ds.view().values_unwind("ground_truth.detections.id").unwrap().len(),
        3
    );
}

#[test]
fn test_save_with_non_label_field_does_not_sync() {
    let (ds, ids) = evaluated_dataset(memory_store());
    let patches = PatchesView::to_patches(&ds.view(), "predictions").unwrap();
    let narrowed = patches.select_ids(&[&ids[3]]);
    let fields = vec!["tags".to_string()];
    narrowed.save(Some(fields.as_slice())).unwrap();

    assert_eq!(patches.count().unwrap(), 1);
    assert_eq!(
        ds.view().values_unwind("predictions.detections.id").unwrap().len(),
        5
    );
}

#[test]
fn test_evaluation_patch_counts() {
    let (ds, ids) = evaluated_dataset(memory_store());
    let patches = PatchesView::to_evaluation_patches(&ds.view(), "eval").unwrap();
    assert_eq!(patches.gt_field(), Some("ground_truth"));
    assert_eq!(patches.pred_field(), Some("predictions"));

    // G + (P - M)
    assert_eq!(patches.count().unwrap(), 3 + (5 - 3));

    let types = patches.values("type").unwrap();
    let count = |t: &str| types.iter().filter(|v| *v == &json!(t)).count();
    assert_eq!(count("tp"), 2);
    assert_eq!(count("fn"), 1);
    assert_eq!(count("fp"), 2);

    // g ground-truth patches carry a non-empty prediction list
    let with_preds = patches
        .match_expr(Expr::exists(Expr::field("predictions")))
        .match_expr(Expr::exists(Expr::field("ground_truth")))
        .count()
        .unwrap();
    assert_eq!(with_preds, 2);

    let crowd = patches.get(&ids[0]).unwrap();
    assert_eq!(crowd.crowd(), Some(true));
    assert_eq!(crowd.patch_type(), Some("tp"));
    assert_eq!(crowd.iou(), Some(0.8));
    assert_eq!(
        crowd.get("predictions.detections.id"),
        Some(json!([ids[3], ids[4]]))
    );
    let single = patches.get(&ids[1]).unwrap();
    assert_eq!(single.crowd(), None);
    assert_eq!(single.get("predictions.detections.id"), Some(json!([ids[5]])));
}

#[test]
fn test_evaluation_patches_sync_both_fields() {
    let (ds, ids) = evaluated_dataset(memory_store());
    let patches = PatchesView::to_evaluation_patches(&ds.view(), "eval").unwrap();

    // Drop the false negative and one false positive
    patches.exclude_ids(&[&ids[2], &ids[7]]).save(None).unwrap();

    let gt = string_set(ds.view().values_unwind("ground_truth.detections.id").unwrap());
    let pred = string_set(ds.view().values_unwind("predictions.detections.id").unwrap());
    assert!(!gt.contains(&ids[2]));
    assert!(!pred.contains(&ids[7]));
    assert_eq!(gt.len(), 2);
    assert_eq!(pred.len(), 4);
}

#[test]
fn test_reload_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = LabelsetConfig::from_env(dir.path()).unwrap();
    config.rand_seed = Some(99);
    let store = Arc::new(DocumentStore::from_config(&config).unwrap());
    let (ds, _) = evaluated_dataset(store);

    let patches = PatchesStage::to_patches("predictions")
        .with_other_fields(OtherFields::fields(["tags"]))
        .load_view(&ds.view())
        .unwrap();
    let ids_before = patches.ids().unwrap();
    let labels_before = patches.values("predictions").unwrap();

    patches.reload().unwrap();
    assert_eq!(patches.ids().unwrap(), ids_before);
    assert_eq!(patches.values("predictions").unwrap(), labels_before);

    patches.reload().unwrap();
    assert_eq!(patches.ids().unwrap(), ids_before);
}

#[test]
fn test_frame_patches() {
    let store = memory_store();
    let video = Dataset::create_with(
        store,
        "clips",
        DatasetOptions {
            media_type: MediaType::Video,
            ..Default::default()
        },
    )
    .unwrap();

    let gt = det("car");
    let pred = det("car");
    let (gt_id, pred_id) = (gt.id.clone(), pred.id.clone());
    let gt = gt.with_eval("eval", "tp", &pred_id, Some(0.9));
    let pred = pred.with_eval("eval", "tp", &gt_id, Some(0.9));
    let mut frame = Map::new();
    frame.insert("gt".into(), serde_json::to_value(Detections::new(vec![gt.clone()])).unwrap());
    frame.insert("pred".into(), serde_json::to_value(Detections::new(vec![pred])).unwrap());
    let sample = Sample::new("clip.mp4").with_frame(1, Map::new()).with_frame(2, frame);
    let frame_ids = sample.get("frames.id").unwrap();
    let video_id = video.add_sample(sample).unwrap();
    video
        .register_evaluation("eval", EvaluationConfig::new("frames.gt", "frames.pred"))
        .unwrap();

    assert!(matches!(
        PatchesView::to_patches(&video.view(), "frames.gt"),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        PatchesView::to_evaluation_patches(&video.view(), "eval"),
        Err(Error::Config(_))
    ));

    let frames = video.to_frames("clips-frames").unwrap();
    let patches = PatchesView::to_patches(&frames.view(), "gt").unwrap();
    assert!(patches.is_frames());
    let patch = patches.first().unwrap();
    assert_eq!(patch.id(), gt.id);
    assert_eq!(patch.sample_id(), Some(video_id.as_str()));
    assert_eq!(patch.frame_id(), frame_ids[1].as_str());
    assert_eq!(patch.frame_number(), Some(2));

    let index_names: Vec<String> = patches
        .patches_dataset()
        .list_indexes()
        .unwrap()
        .into_iter()
        .map(|i| i.name)
        .collect();
    for name in ["sample_id", "frame_id", "_sample_id_1_frame_number_1"] {
        assert!(index_names.iter().any(|n| n == name), "missing index {}", name);
    }

    // Edits land on the frame sample
    patches
        .set_values("gt.label", vec![json!("taxi")])
        .unwrap();
    let frame_doc = frames.get_sample(patch.frame_id().unwrap()).unwrap().unwrap();
    assert_eq!(frame_doc.get("gt.detections.label"), Some(json!(["taxi"])));

    let eval_patches = PatchesView::to_evaluation_patches(&frames.view(), "eval").unwrap();
    assert_eq!(eval_patches.gt_field(), Some("gt"));
    assert_eq!(eval_patches.count().unwrap(), 1);
    assert_eq!(
        eval_patches.patches_dataset().get_label_field_type("pred").unwrap(),
        LabelType::Detections
    );

    // A sample-level run cannot be viewed through frames
    frames
        .register_evaluation("flat", EvaluationConfig::new("gt", "pred"))
        .unwrap();
    assert!(matches!(
        PatchesView::to_evaluation_patches(&frames.view(), "flat"),
        Err(Error::Config(_))
    ));
}
