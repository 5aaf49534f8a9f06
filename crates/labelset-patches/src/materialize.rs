//! Writing pipeline output into a derived dataset.
//!
//! Every call appends one sink stage to the plan and commits it in a single
//! store transaction. Records are matched on `_id`.

use tracing::debug;

use labelset_core::Result;
use labelset_dataset::Dataset;
use labelset_store::{Pipeline, WhenMatched, WhenNotMatched, WriteReport};

/// Sinks pipeline output into `target`.
pub struct Materializer<'a> {
    target: &'a Dataset,
}

impl<'a> Materializer<'a> {
    pub fn new(target: &'a Dataset) -> Self {
        Self { target }
    }

    /// Replace the target's contents with the plan's output.
    pub fn overwrite(&self, source: &Dataset, plan: Pipeline) -> Result<WriteReport> {
        let plan = plan.out(self.target.sample_collection());
        self.run("overwrite", source, plan)
    }

    /// Insert records whose `_id` is new; leave existing records untouched.
    pub fn upsert(&self, source: &Dataset, plan: Pipeline) -> Result<WriteReport> {
        let plan = plan.merge(
            self.target.sample_collection(),
            WhenMatched::KeepExisting,
            WhenNotMatched::Insert,
        );
        self.run("upsert", source, plan)
    }

    /// Write the fields present on each output record into the existing
    /// record with the same `_id`. Records with no counterpart are dropped.
    pub fn merge_into(&self, source: &Dataset, plan: Pipeline) -> Result<WriteReport> {
        let plan = plan.merge(
            self.target.sample_collection(),
            WhenMatched::Merge,
            WhenNotMatched::Discard,
        );
        self.run("merge_into", source, plan)
    }

    fn run(&self, op: &str, source: &Dataset, plan: Pipeline) -> Result<WriteReport> {
        let report = source
            .store()
            .execute(source.sample_collection(), &plan)?;
        debug!(
            "{} {} -> {}: {} stages, {:?}",
            op,
            source.name(),
            self.target.name(),
            plan.len(),
            report
        );
        Ok(report)
    }
}
