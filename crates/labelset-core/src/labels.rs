//! Label type registry and typed label documents.
//!
//! Label fields are stored as JSON objects tagged with `_cls`. List labels
//! (`Detections`, `Polylines`, ...) hold an ordered array of singular
//! elements under a type-specific attribute, and every element carries its
//! own `_id`, distinct from the id of the sample that owns it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::id::generate_id;

/// Closed set of label classes known to the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabelType {
    Classification,
    Classifications,
    Detection,
    Detections,
    Polyline,
    Polylines,
    Keypoint,
    Keypoints,
}

/// List type → (element type, attribute holding the elements).
const LIST_TYPES: &[(LabelType, LabelType, &str)] = &[
    (
        LabelType::Classifications,
        LabelType::Classification,
        "classifications",
    ),
    (LabelType::Detections, LabelType::Detection, "detections"),
    (LabelType::Polylines, LabelType::Polyline, "polylines"),
    (LabelType::Keypoints, LabelType::Keypoint, "keypoints"),
];

/// List types whose elements can be extracted as patches.
pub const PATCHES_TYPES: &[LabelType] = &[LabelType::Detections, LabelType::Polylines];

impl LabelType {
    /// The `_cls` tag stored on documents of this type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Classification => "Classification",
            Self::Classifications => "Classifications",
            Self::Detection => "Detection",
            Self::Detections => "Detections",
            Self::Polyline => "Polyline",
            Self::Polylines => "Polylines",
            Self::Keypoint => "Keypoint",
            Self::Keypoints => "Keypoints",
        }
    }

    /// Parse a `_cls` tag.
    pub fn from_cls(cls: &str) -> Result<Self> {
        let label_type = match cls {
            "Classification" => Self::Classification,
            "Classifications" => Self::Classifications,
            "Detection" => Self::Detection,
            "Detections" => Self::Detections,
            "Polyline" => Self::Polyline,
            "Polylines" => Self::Polylines,
            "Keypoint" => Self::Keypoint,
            "Keypoints" => Self::Keypoints,
            other => return Err(Error::Schema(format!("Unknown label class '{}'", other))),
        };
        Ok(label_type)
    }

    pub fn is_list(&self) -> bool {
        LIST_TYPES.iter().any(|(list, _, _)| list == self)
    }

    /// Attribute holding the element sequence, for list types.
    pub fn list_field(&self) -> Option<&'static str> {
        LIST_TYPES
            .iter()
            .find(|(list, _, _)| list == self)
            .map(|(_, _, field)| *field)
    }

    /// Element type of a list type.
    pub fn element_type(&self) -> Option<LabelType> {
        LIST_TYPES
            .iter()
            .find(|(list, _, _)| list == self)
            .map(|(_, element, _)| *element)
    }

    /// Whether elements of this type can be extracted as patches.
    pub fn supports_patches(&self) -> bool {
        PATCHES_TYPES.contains(self)
    }
}

impl std::fmt::Display for LabelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Singular element type for a patchable list type.
///
/// Only the registered patch types resolve; everything else, including other
/// list types such as `Classifications`, is rejected.
pub fn singular_type_of(list_type: LabelType) -> Result<LabelType> {
    if !list_type.supports_patches() {
        return Err(Error::UnsupportedLabelType(format!(
            "{} (patches are supported for: {})",
            list_type,
            PATCHES_TYPES
                .iter()
                .map(|t| t.name())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }
    list_type
        .element_type()
        .ok_or_else(|| Error::Internal(format!("No element type registered for {}", list_type)))
}

/// Name of the attribute holding the element sequence of a list type.
pub fn list_field_name(label_type: LabelType) -> Result<&'static str> {
    label_type.list_field().ok_or_else(|| {
        Error::UnsupportedLabelType(format!("{} is not a label list type", label_type))
    })
}

fn detection_cls() -> String {
    LabelType::Detection.name().to_string()
}

fn detections_cls() -> String {
    LabelType::Detections.name().to_string()
}

fn polyline_cls() -> String {
    LabelType::Polyline.name().to_string()
}

fn polylines_cls() -> String {
    LabelType::Polylines.name().to_string()
}

/// An object detection in relative `[x, y, w, h]` coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "_id", default = "generate_id")]
    pub id: String,
    #[serde(rename = "_cls", default = "detection_cls")]
    pub cls: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub bounding_box: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Custom attributes and evaluation results (`<key>`, `<key>_id`, `<key>_iou`).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Detection {
    pub fn new(label: impl Into<String>, bounding_box: [f64; 4]) -> Self {
        Self {
            id: generate_id(),
            cls: detection_cls(),
            label: Some(label.into()),
            bounding_box: bounding_box.to_vec(),
            confidence: None,
            extra: Map::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Evaluation outcome as written by an evaluation run under `eval_key`.
    pub fn with_eval(self, eval_key: &str, outcome: &str, match_id: &str, iou: Option<f64>) -> Self {
        let iou = iou.map(Value::from).unwrap_or(Value::Null);
        self.with_attr(eval_key, outcome)
            .with_attr(format!("{}_id", eval_key), match_id)
            .with_attr(format!("{}_iou", eval_key), iou)
    }
}

/// A list of object detections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detections {
    #[serde(rename = "_cls", default = "detections_cls")]
    pub cls: String,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl Detections {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            cls: detections_cls(),
            detections,
        }
    }
}

/// A set of (optionally closed/filled) polylines in relative coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polyline {
    #[serde(rename = "_id", default = "generate_id")]
    pub id: String,
    #[serde(rename = "_cls", default = "polyline_cls")]
    pub cls: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub points: Vec<Vec<[f64; 2]>>,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub filled: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Polyline {
    pub fn new(label: impl Into<String>, points: Vec<Vec<[f64; 2]>>) -> Self {
        Self {
            id: generate_id(),
            cls: polyline_cls(),
            label: Some(label.into()),
            points,
            closed: false,
            filled: false,
            extra: Map::new(),
        }
    }

    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }
}

/// A list of polylines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polylines {
    #[serde(rename = "_cls", default = "polylines_cls")]
    pub cls: String,
    #[serde(default)]
    pub polylines: Vec<Polyline>,
}

impl Polylines {
    pub fn new(polylines: Vec<Polyline>) -> Self {
        Self {
            cls: polylines_cls(),
            polylines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singular_type_of_registered() {
        assert_eq!(
            singular_type_of(LabelType::Detections).unwrap(),
            LabelType::Detection
        );
        assert_eq!(
            singular_type_of(LabelType::Polylines).unwrap(),
            LabelType::Polyline
        );
    }

    #[test]
    fn test_singular_type_of_rejects_unregistered() {
        let result = singular_type_of(LabelType::Classifications);
        assert!(matches!(result, Err(Error::UnsupportedLabelType(_))));
        let result = singular_type_of(LabelType::Detection);
        assert!(matches!(result, Err(Error::UnsupportedLabelType(_))));
    }

    #[test]
    fn test_list_field_name() {
        assert_eq!(list_field_name(LabelType::Detections).unwrap(), "detections");
        assert_eq!(list_field_name(LabelType::Polylines).unwrap(), "polylines");
        assert_eq!(
            list_field_name(LabelType::Classifications).unwrap(),
            "classifications"
        );
        assert!(list_field_name(LabelType::Detection).is_err());
    }

    #[test]
    fn test_from_cls() {
        assert_eq!(LabelType::from_cls("Polylines").unwrap(), LabelType::Polylines);
        assert!(matches!(LabelType::from_cls("Segmentation"), Err(Error::Schema(_))));
    }

    #[test]
    fn test_detection_json_shape() {
        let det = Detection::new("cat", [0.1, 0.2, 0.3, 0.4])
            .with_confidence(0.9)
            .with_attr("iscrowd", 1);
        let value = serde_json::to_value(&det).unwrap();
        assert_eq!(value["_cls"], "Detection");
        assert_eq!(value["_id"], det.id.as_str());
        assert_eq!(value["iscrowd"], 1);
        assert_eq!(value["bounding_box"][3], 0.4);

        let back: Detection = serde_json::from_value(value).unwrap();
        assert_eq!(back, det);
    }

    #[test]
    fn test_detections_json_shape() {
        let dets = Detections::new(vec![Detection::new("dog", [0.0, 0.0, 1.0, 1.0])]);
        let value = serde_json::to_value(&dets).unwrap();
        assert_eq!(value["_cls"], "Detections");
        assert_eq!(value["detections"][0]["label"], "dog");
    }

    #[test]
    fn test_with_eval_keys() {
        let det = Detection::new("cat", [0.0; 4]).with_eval("eval", "tp", "abc", Some(0.75));
        assert_eq!(det.extra["eval"], "tp");
        assert_eq!(det.extra["eval_id"], "abc");
        assert_eq!(det.extra["eval_iou"], 0.75);
    }
}
