//! Labelset Dataset — sample collections, views and evaluation runs.

pub mod dataset;
pub mod evaluation;
pub mod sample;
pub mod schema;
pub mod view;

pub use dataset::{Dataset, DatasetOptions, MediaType};
pub use evaluation::{EvaluationConfig, EvaluationInfo};
pub use sample::Sample;
pub use schema::{db_field, to_db_path, FieldDef, FieldKind, FRAMES_PREFIX};
pub use view::DatasetView;
