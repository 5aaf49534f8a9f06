//! Staged aggregation pipelines.
//!
//! A [`Pipeline`] is an inert value: building one executes nothing. The
//! store runs the transformation stages in order over a collection's
//! documents and, if the final stage is a sink (`Out` or `Merge`), commits
//! the result to the target collection.

use std::collections::HashMap;

use rand::RngCore;
use serde_json::{Map, Value};

use crate::expr::{compare_values, truthy, Expr};
use crate::path::{get_path, include_path, remove_path, set_path};
use labelset_core::{Error, Result};

/// A field in a `$project` stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Include,
    Computed(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accumulator {
    /// Collect values into an array, in encounter order.
    Push,
    First,
}

/// Behavior of a `Merge` sink when the incoming `_id` already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenMatched {
    /// Overwrite the top-level fields present on the incoming document.
    Merge,
    KeepExisting,
    Replace,
}

/// Behavior of a `Merge` sink when the incoming `_id` does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenNotMatched {
    Insert,
    Discard,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOptions {
    pub into: String,
    pub when_matched: WhenMatched,
    pub when_not_matched: WhenNotMatched,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Project {
        include_id: bool,
        fields: Vec<(String, Projection)>,
    },
    /// One output document per element of the array at the path. Documents
    /// whose value is missing, null or empty are dropped.
    Unwind(String),
    Set(Vec<(String, Expr)>),
    Unset(Vec<String>),
    Match(Expr),
    /// Groups by `key`; output documents are `{_id: key, <name>: acc, ...}`
    /// in first-seen key order.
    Group {
        key: Expr,
        accumulators: Vec<(String, Accumulator, Expr)>,
    },
    ReplaceRoot(Expr),
    Sort {
        field: String,
        ascending: bool,
    },
    Skip(usize),
    Limit(usize),
    /// Replace the target collection with the output.
    Out(String),
    /// Merge the output into the target collection on `_id`.
    Merge(MergeOptions),
}

impl Stage {
    pub fn is_sink(&self) -> bool {
        matches!(self, Self::Out(_) | Self::Merge(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_stages(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub fn then(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn extend(mut self, other: Pipeline) -> Self {
        self.stages.extend(other.stages);
        self
    }

    pub fn project<K: Into<String>>(
        self,
        include_id: bool,
        fields: impl IntoIterator<Item = (K, Projection)>,
    ) -> Self {
        self.then(Stage::Project {
            include_id,
            fields: fields.into_iter().map(|(k, p)| (k.into(), p)).collect(),
        })
    }

    pub fn unwind(self, path: impl Into<String>) -> Self {
        self.then(Stage::Unwind(path.into()))
    }

    pub fn set(self, path: impl Into<String>, expr: Expr) -> Self {
        self.then(Stage::Set(vec![(path.into(), expr)]))
    }

    pub fn unset(self, path: impl Into<String>) -> Self {
        self.then(Stage::Unset(vec![path.into()]))
    }

    pub fn matching(self, expr: Expr) -> Self {
        self.then(Stage::Match(expr))
    }

    pub fn out(self, into: impl Into<String>) -> Self {
        self.then(Stage::Out(into.into()))
    }

    pub fn merge(
        self,
        into: impl Into<String>,
        when_matched: WhenMatched,
        when_not_matched: WhenNotMatched,
    ) -> Self {
        self.then(Stage::Merge(MergeOptions {
            into: into.into(),
            when_matched,
            when_not_matched,
        }))
    }

    /// Split off a trailing sink. Sinks anywhere else are rejected.
    pub fn split_sink(&self) -> Result<(&[Stage], Option<&Stage>)> {
        let (body, sink) = match self.stages.split_last() {
            Some((last, body)) if last.is_sink() => (body, Some(last)),
            _ => (self.stages.as_slice(), None),
        };
        if body.iter().any(Stage::is_sink) {
            return Err(Error::Pipeline(
                "Out/Merge may only appear as the final stage".into(),
            ));
        }
        Ok((body, sink))
    }
}

/// Run transformation stages over `docs`. Sink stages are rejected here;
/// the store handles them after the transformation completes.
pub fn run_stages(stages: &[Stage], docs: Vec<Value>, rng: &mut dyn RngCore) -> Result<Vec<Value>> {
    let mut docs = docs;
    for stage in stages {
        docs = apply_stage(stage, docs, rng)?;
    }
    Ok(docs)
}

fn apply_stage(stage: &Stage, docs: Vec<Value>, rng: &mut dyn RngCore) -> Result<Vec<Value>> {
    let out = match stage {
        Stage::Project { include_id, fields } => docs
            .into_iter()
            .map(|doc| project(&doc, *include_id, fields, rng))
            .collect(),
        Stage::Unwind(path) => {
            let mut out = Vec::with_capacity(docs.len());
            for doc in docs {
                match get_path(&doc, path) {
                    Some(Value::Array(items)) => {
                        for item in items {
                            let mut copy = doc.clone();
                            set_path(&mut copy, path, item);
                            out.push(copy);
                        }
                    }
                    None | Some(Value::Null) => {}
                    Some(_) => out.push(doc),
                }
            }
            out
        }
        Stage::Set(assignments) => docs
            .into_iter()
            .map(|mut doc| {
                // All expressions see the document as it was before the stage
                let values: Vec<(&String, Option<Value>)> = assignments
                    .iter()
                    .map(|(path, expr)| (path, expr.eval(&doc, rng)))
                    .collect();
                for (path, value) in values {
                    if let Some(value) = value {
                        set_path(&mut doc, path, value);
                    }
                }
                doc
            })
            .collect(),
        Stage::Unset(paths) => docs
            .into_iter()
            .map(|mut doc| {
                for path in paths {
                    remove_path(&mut doc, path);
                }
                doc
            })
            .collect(),
        Stage::Match(expr) => docs
            .into_iter()
            .filter(|doc| truthy(&expr.eval(doc, rng)))
            .collect(),
        Stage::Group { key, accumulators } => group(docs, key, accumulators, rng),
        Stage::ReplaceRoot(expr) => {
            let mut out = Vec::with_capacity(docs.len());
            for doc in docs {
                match expr.eval(&doc, rng) {
                    Some(root @ Value::Object(_)) => out.push(root),
                    other => {
                        return Err(Error::Pipeline(format!(
                            "ReplaceRoot expression must produce an object, got {:?}",
                            other
                        )))
                    }
                }
            }
            out
        }
        Stage::Sort { field, ascending } => {
            let mut docs = docs;
            docs.sort_by(|a, b| {
                let va = get_path(a, field).unwrap_or(Value::Null);
                let vb = get_path(b, field).unwrap_or(Value::Null);
                let ord = compare_values(&va, &vb);
                if *ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
            docs
        }
        Stage::Skip(n) => docs.into_iter().skip(*n).collect(),
        Stage::Limit(n) => docs.into_iter().take(*n).collect(),
        Stage::Out(_) | Stage::Merge(_) => {
            return Err(Error::Pipeline(
                "sink stages are executed by the store".into(),
            ))
        }
    };
    Ok(out)
}

fn project(
    doc: &Value,
    include_id: bool,
    fields: &[(String, Projection)],
    rng: &mut dyn RngCore,
) -> Value {
    let mut out = Value::Object(Map::new());
    if include_id {
        if let Some(id) = doc.get("_id") {
            set_path(&mut out, "_id", id.clone());
        }
    }
    for (path, projection) in fields {
        match projection {
            Projection::Include => include_path(doc, &mut out, path),
            Projection::Computed(expr) => {
                if let Some(v) = expr.eval(doc, rng) {
                    set_path(&mut out, path, v);
                }
            }
        }
    }
    out
}

fn group(
    docs: Vec<Value>,
    key: &Expr,
    accumulators: &[(String, Accumulator, Expr)],
    rng: &mut dyn RngCore,
) -> Vec<Value> {
    // Group keys are compared by their JSON text so any value can be a key
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, (Value, Vec<Value>)> = HashMap::new();

    for doc in docs {
        let key_value = key.eval(&doc, rng).unwrap_or(Value::Null);
        let key_text = key_value.to_string();
        let entry = groups.entry(key_text.clone()).or_insert_with(|| {
            order.push(key_text);
            let initial = accumulators
                .iter()
                .map(|(_, acc, _)| match acc {
                    Accumulator::Push => Value::Array(Vec::new()),
                    Accumulator::First => Value::Null,
                })
                .collect();
            (key_value, initial)
        });
        for (i, (_, acc, expr)) in accumulators.iter().enumerate() {
            let value = expr.eval(&doc, rng);
            match acc {
                Accumulator::Push => {
                    if let Value::Array(items) = &mut entry.1[i] {
                        items.push(value.unwrap_or(Value::Null));
                    }
                }
                Accumulator::First => {
                    if entry.1[i].is_null() {
                        entry.1[i] = value.unwrap_or(Value::Null);
                    }
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|k| groups.remove(&k))
        .map(|(key_value, values)| {
            let mut out = Map::new();
            out.insert("_id".to_string(), key_value);
            for ((name, _, _), value) in accumulators.iter().zip(values) {
                out.insert(name.clone(), value);
            }
            Value::Object(out)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn run(pipeline: &Pipeline, docs: Vec<Value>) -> Vec<Value> {
        let mut rng = StdRng::seed_from_u64(42);
        let (stages, sink) = pipeline.split_sink().unwrap();
        assert!(sink.is_none());
        run_stages(stages, docs, &mut rng).unwrap()
    }

    fn samples() -> Vec<Value> {
        vec![
            json!({"_id": "s1", "filepath": "a.jpg", "gt": {"_cls": "Detections", "detections": [
                {"_id": "d1", "label": "cat"}, {"_id": "d2", "label": "dog"}
            ]}}),
            json!({"_id": "s2", "filepath": "b.jpg", "gt": {"_cls": "Detections", "detections": []}}),
            json!({"_id": "s3", "filepath": "c.jpg"}),
        ]
    }

    #[test]
    fn test_project_unwind_set() {
        let pipeline = Pipeline::new()
            .project(
                false,
                [
                    ("filepath", Projection::Include),
                    ("gt.detections", Projection::Include),
                    ("_sample_id", Projection::Computed(Expr::field("_id"))),
                ],
            )
            .unwind("gt.detections")
            .set("_id", Expr::field("gt.detections._id"))
            .set("gt", Expr::field("gt.detections"));

        let out = run(&pipeline, samples());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["_id"], "d1");
        assert_eq!(out[0]["_sample_id"], "s1");
        assert_eq!(out[0]["gt"]["label"], "cat");
        assert_eq!(out[1]["_id"], "d2");
        assert!(out[0].get("_cls").is_none());
    }

    #[test]
    fn test_set_skips_missing() {
        let pipeline = Pipeline::new().set("x", Expr::field("nope"));
        let out = run(&pipeline, vec![json!({"_id": "a"})]);
        assert_eq!(out[0], json!({"_id": "a"}));
    }

    #[test]
    fn test_group_preserves_encounter_order() {
        let docs = vec![
            json!({"m": "g2", "v": 1}),
            json!({"m": "g1", "v": 2}),
            json!({"m": "g2", "v": 3}),
        ];
        let pipeline = Pipeline::new().then(Stage::Group {
            key: Expr::field("m"),
            accumulators: vec![("vs".into(), Accumulator::Push, Expr::field("v"))],
        });
        let out = run(&pipeline, docs);
        assert_eq!(out, vec![json!({"_id": "g2", "vs": [1, 3]}), json!({"_id": "g1", "vs": [2]})]);
    }

    #[test]
    fn test_sort_skip_limit() {
        let docs = vec![json!({"n": 3}), json!({"n": 1}), json!({"n": 2})];
        let pipeline = Pipeline::new()
            .then(Stage::Sort {
                field: "n".into(),
                ascending: false,
            })
            .then(Stage::Skip(1))
            .then(Stage::Limit(1));
        assert_eq!(run(&pipeline, docs), vec![json!({"n": 2})]);
    }

    #[test]
    fn test_replace_root_merge_objects() {
        let docs = vec![json!({"_sample_id": "s", "frames": {"_id": "f", "frame_number": 1}})];
        let pipeline = Pipeline::new().then(Stage::ReplaceRoot(Expr::MergeObjects(vec![
            Expr::field("frames"),
            Expr::object([("_sample_id", Expr::field("_sample_id"))]),
        ])));
        assert_eq!(
            run(&pipeline, docs),
            vec![json!({"_id": "f", "frame_number": 1, "_sample_id": "s"})]
        );
    }

    #[test]
    fn test_sink_must_be_last() {
        let bad = Pipeline::new().out("x").then(Stage::Limit(1));
        assert!(matches!(bad.split_sink(), Err(Error::Pipeline(_))));
        let good = Pipeline::new().then(Stage::Limit(1)).out("x");
        let (body, sink) = good.split_sink().unwrap();
        assert_eq!(body.len(), 1);
        assert!(matches!(sink, Some(Stage::Out(_))));
    }
}
