//! Plain-text summaries printed by the CLI.

use std::collections::BTreeMap;

use serde_json::Value;

use labelset_core::Result;
use labelset_dataset::Dataset;
use labelset_patches::PatchesView;

/// Occurrences of each string value; non-strings count as `(none)`.
pub fn tally(values: &[Value]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for value in values {
        let key = value.as_str().unwrap_or("(none)").to_string();
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}

pub fn print_dataset(dataset: &Dataset) -> Result<()> {
    println!("Name:        {}", dataset.name());
    println!("Media type:  {}", dataset.media_type().as_str());
    println!("Samples:     {}", dataset.count()?);
    println!("Fields:");
    for field in dataset.field_schema() {
        println!("  {:<24} {:?}", field.name, field.kind);
    }
    let evaluations = dataset.list_evaluations();
    if !evaluations.is_empty() {
        println!("Evaluations: {}", evaluations.join(", "));
    }
    Ok(())
}

pub fn print_patches(patches: &PatchesView) -> Result<()> {
    let sample_ids = patches.values("sample_id")?;
    let distinct: std::collections::HashSet<&str> =
        sample_ids.iter().filter_map(|v| v.as_str()).collect();
    println!("View:     {}", patches.name());
    println!("Fields:   {}", patches.label_fields().join(", "));
    println!("Patches:  {}", patches.count()?);
    println!("Samples:  {}", distinct.len());
    Ok(())
}

pub fn print_evaluation_patches(patches: &PatchesView) -> Result<()> {
    print_patches(patches)?;
    let counts = tally(&patches.values("type")?);
    for outcome in ["tp", "fp", "fn"] {
        println!("  {}: {}", outcome, counts.get(outcome).copied().unwrap_or(0));
    }
    let crowd = patches.values("crowd")?;
    let crowd_count = crowd.iter().filter(|v| v.as_bool() == Some(true)).count();
    if crowd_count > 0 {
        println!("  crowd: {}", crowd_count);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tally() {
        let counts = tally(&[json!("tp"), json!("fp"), json!("tp"), json!(null)]);
        assert_eq!(counts.get("tp"), Some(&2));
        assert_eq!(counts.get("fp"), Some(&1));
        assert_eq!(counts.get("(none)"), Some(&1));
        assert_eq!(counts.get("fn"), None);
    }
}
