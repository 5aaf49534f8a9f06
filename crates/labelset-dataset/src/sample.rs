//! Sample documents.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::schema::to_db_path;
use labelset_core::{generate_id, Error, Result};
use labelset_store::path::{get_path, remove_path, set_path, try_set_path};

/// A sample document. Field accessors take public names (`id`,
/// `sample_id`, `gt.detections.id`) and translate them to storage paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sample {
    doc: Value,
}

impl Sample {
    /// New sample with a fresh id and empty tags.
    pub fn new(filepath: impl Into<String>) -> Self {
        let mut doc = Map::new();
        doc.insert("_id".into(), Value::String(generate_id()));
        doc.insert("filepath".into(), Value::String(filepath.into()));
        doc.insert("tags".into(), Value::Array(Vec::new()));
        doc.insert("metadata".into(), Value::Null);
        Self {
            doc: Value::Object(doc),
        }
    }

    /// Wrap a stored document. It must be an object with a string `_id`.
    pub fn from_doc(doc: Value) -> Result<Self> {
        match doc.get("_id") {
            Some(Value::String(_)) => Ok(Self { doc }),
            _ => Err(Error::Schema(format!("sample document without _id: {}", doc))),
        }
    }

    pub fn id(&self) -> &str {
        self.doc.get("_id").and_then(|v| v.as_str()).unwrap_or_default()
    }

    pub fn filepath(&self) -> Option<&str> {
        self.doc.get("filepath").and_then(|v| v.as_str())
    }

    pub fn tags(&self) -> Vec<String> {
        self.doc
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        get_path(&self.doc, &to_db_path(field))
    }

    /// Deserialize a field, e.g. `sample.label::<Detections>("gt")`.
    pub fn label<L: DeserializeOwned>(&self, field: &str) -> Result<Option<L>> {
        match self.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    pub fn set(&mut self, field: &str, value: Value) {
        set_path(&mut self.doc, &to_db_path(field), value);
    }

    /// Set a field, requiring one value per element wherever the path
    /// crosses a list (`gt.detections.label` takes a list of labels).
    pub fn try_set(&mut self, field: &str, value: Value) -> Result<()> {
        try_set_path(&mut self.doc, &to_db_path(field), value)
    }

    pub fn clear(&mut self, field: &str) -> Option<Value> {
        remove_path(&mut self.doc, &to_db_path(field))
    }

    pub fn with_value(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value.into());
        self
    }

    /// Set a field from any serializable label.
    pub fn with_label<L: Serialize>(mut self, field: &str, label: &L) -> Result<Self> {
        self.set(field, serde_json::to_value(label)?);
        Ok(self)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        if let Some(Value::Array(tags)) = self.doc.get_mut("tags") {
            tags.push(Value::String(tag.into()));
        }
        self
    }

    /// Append a frame to a video sample. `fields` are frame-level fields.
    pub fn with_frame(mut self, frame_number: u64, fields: Map<String, Value>) -> Self {
        let mut frame = Map::new();
        frame.insert("_id".into(), Value::String(generate_id()));
        frame.insert("frame_number".into(), Value::from(frame_number));
        frame.extend(fields);
        if let Value::Object(doc) = &mut self.doc {
            let frames = doc
                .entry("frames")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(frames) = frames {
                frames.push(Value::Object(frame));
            }
        }
        self
    }

    pub fn as_value(&self) -> &Value {
        &self.doc
    }

    pub fn into_value(self) -> Value {
        self.doc
    }

    pub(crate) fn doc_mut(&mut self) -> &mut Value {
        &mut self.doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labelset_core::{Detection, Detections};
    use serde_json::json;

    #[test]
    fn test_new_sample_defaults() {
        let sample = Sample::new("/data/a.jpg");
        assert_eq!(sample.id().len(), 24);
        assert_eq!(sample.filepath(), Some("/data/a.jpg"));
        assert!(sample.tags().is_empty());
    }

    #[test]
    fn test_label_roundtrip_and_public_paths() {
        let det = Detection::new("cat", [0.1, 0.1, 0.2, 0.2]);
        let det_id = det.id.clone();
        let sample = Sample::new("a.jpg")
            .with_label("gt", &Detections::new(vec![det]))
            .unwrap()
            .with_tag("train");

        let dets: Detections = sample.label("gt").unwrap().unwrap();
        assert_eq!(dets.detections[0].label.as_deref(), Some("cat"));
        assert_eq!(sample.get("gt.detections.id"), Some(json!([det_id])));
        assert_eq!(sample.tags(), vec!["train".to_string()]);
        assert!(sample.label::<Detections>("missing").unwrap().is_none());
    }

    #[test]
    fn test_from_doc_requires_id() {
        assert!(Sample::from_doc(json!({"filepath": "x"})).is_err());
        assert!(Sample::from_doc(json!({"_id": "abc"})).is_ok());
    }

    #[test]
    fn test_with_frame() {
        let mut fields = Map::new();
        fields.insert("weather".into(), json!("sunny"));
        let sample = Sample::new("v.mp4").with_frame(1, fields).with_frame(2, Map::new());
        let frames = sample.get("frames").unwrap();
        assert_eq!(frames.as_array().unwrap().len(), 2);
        assert_eq!(frames[0]["frame_number"], 1);
        assert_eq!(frames[0]["weather"], "sunny");
    }
}
