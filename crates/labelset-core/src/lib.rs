//! Labelset Core — errors, configuration, identifiers, label schema.

pub mod config;
pub mod error;
pub mod id;
pub mod labels;

pub use config::{DataPaths, LabelsetConfig};
pub use error::{Error, Result};
pub use id::generate_id;
pub use labels::{
    list_field_name, singular_type_of, Detection, Detections, LabelType, Polyline, Polylines,
    PATCHES_TYPES,
};
