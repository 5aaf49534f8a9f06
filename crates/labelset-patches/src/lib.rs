//! Labelset Patches — per-object patch datasets and evaluation patches.
//!
//! A patches view turns every element of a `Detections`/`Polylines` field
//! into its own sample. Each patch keeps the id of the element it came from,
//! which is how edits and deletions find their way back to the source.

pub mod evaluation;
pub mod extract;
pub mod materialize;
pub mod view;

pub use evaluation::{
    make_evaluation_patches_dataset, AssemblyReport, AssemblyStage, EvaluationAssembly,
};
pub use extract::{make_patches_dataset, make_patches_pipeline, OtherFields};
pub use materialize::Materializer;
pub use view::{Patch, PatchesStage, PatchesView};
