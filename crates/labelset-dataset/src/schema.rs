//! Sample field schema and public/storage field name mapping.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use labelset_core::LabelType;

/// Prefix of frame-level fields on video datasets.
pub const FRAMES_PREFIX: &str = "frames.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    Id,
    String,
    Float,
    Int,
    Bool,
    FrameNumber,
    List,
    Dict,
    Label { label_type: LabelType },
}

impl FieldKind {
    pub fn label(label_type: LabelType) -> Self {
        Self::Label { label_type }
    }

    pub fn label_type(&self) -> Option<LabelType> {
        match self {
            Self::Label { label_type } => Some(*label_type),
            _ => None,
        }
    }

    /// Best-effort kind for a stored value; `None` for null.
    pub fn infer(value: &Value) -> Option<Self> {
        let kind = match value {
            Value::Null => return None,
            Value::Bool(_) => Self::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Int,
            Value::Number(_) => Self::Float,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::List,
            Value::Object(map) => match map.get("_cls").and_then(|c| c.as_str()) {
                Some(cls) => match LabelType::from_cls(cls) {
                    Ok(label_type) => Self::Label { label_type },
                    Err(_) => Self::Dict,
                },
                None => Self::Dict,
            },
        };
        Some(kind)
    }
}

/// A named sample field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Fields every sample has.
pub fn default_fields() -> Vec<FieldDef> {
    vec![
        FieldDef::new("id", FieldKind::Id),
        FieldDef::new("filepath", FieldKind::String),
        FieldDef::new("tags", FieldKind::List),
        FieldDef::new("metadata", FieldKind::Dict),
        FieldDef::new("media_type", FieldKind::String),
    ]
}

/// Storage name of a top-level public field.
pub fn db_field(name: &str) -> &str {
    match name {
        "id" => "_id",
        "sample_id" => "_sample_id",
        "frame_id" => "_frame_id",
        "media_type" => "_media_type",
        other => other,
    }
}

/// Storage path of a public dotted path. Nested `id` segments become `_id`.
pub fn to_db_path(path: &str) -> String {
    let mut parts = path.split('.');
    let mut out = match parts.next() {
        Some(head) => db_field(head).to_string(),
        None => return String::new(),
    };
    for part in parts {
        out.push('.');
        out.push_str(if part == "id" { "_id" } else { part });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_db_path() {
        assert_eq!(to_db_path("id"), "_id");
        assert_eq!(to_db_path("sample_id"), "_sample_id");
        assert_eq!(to_db_path("gt.detections.id"), "gt.detections._id");
        assert_eq!(to_db_path("gt.label"), "gt.label");
        assert_eq!(to_db_path("frames.gt.id"), "frames.gt._id");
    }

    #[test]
    fn test_infer_kind() {
        assert_eq!(
            FieldKind::infer(&json!({"_cls": "Detections", "detections": []})),
            Some(FieldKind::label(LabelType::Detections))
        );
        assert_eq!(FieldKind::infer(&json!({"a": 1})), Some(FieldKind::Dict));
        assert_eq!(FieldKind::infer(&json!(1)), Some(FieldKind::Int));
        assert_eq!(FieldKind::infer(&json!(0.5)), Some(FieldKind::Float));
        assert_eq!(FieldKind::infer(&json!(null)), None);
    }

    #[test]
    fn test_field_def_serde() {
        let def = FieldDef::new("gt", FieldKind::label(LabelType::Polylines));
        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(value, json!({"name": "gt", "kind": "label", "label_type": "Polylines"}));
        let back: FieldDef = serde_json::from_value(value).unwrap();
        assert_eq!(back, def);
    }
}
