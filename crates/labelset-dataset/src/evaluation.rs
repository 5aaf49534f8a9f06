//! Evaluation run registry types.
//!
//! An evaluation run compares a predicted label field against a ground-truth
//! field and writes, onto every element of both, the outcome under the run's
//! key: `<key>` (`tp`/`fp`/`fn`), `<key>_id` (id of the matched element, or
//! [`NO_MATCH_ID`]) and `<key>_iou`. Producing those values is out of scope
//! here; the registry only records how a run was configured.

use serde::{Deserialize, Serialize};

/// Match reference stored on elements that were not matched.
pub const NO_MATCH_ID: &str = "";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    pub gt_field: String,
    pub pred_field: String,
    /// Name of the boolean crowd attribute on ground-truth elements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iscrowd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl EvaluationConfig {
    pub fn new(gt_field: impl Into<String>, pred_field: impl Into<String>) -> Self {
        Self {
            gt_field: gt_field.into(),
            pred_field: pred_field.into(),
            iscrowd: None,
            method: None,
        }
    }

    pub fn with_crowd_attr(mut self, attr: impl Into<String>) -> Self {
        self.iscrowd = Some(attr.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationInfo {
    pub key: String,
    pub config: EvaluationConfig,
    /// Registration time, milliseconds since the epoch.
    pub timestamp: i64,
}

impl EvaluationInfo {
    /// Field on each element holding the match reference.
    pub fn id_attr(&self) -> String {
        format!("{}_id", self.key)
    }

    pub fn iou_attr(&self) -> String {
        format!("{}_iou", self.key)
    }
}
