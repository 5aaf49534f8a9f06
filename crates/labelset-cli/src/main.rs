//! labelset — inspect datasets and their patches from the command line.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

mod report;

use labelset_core::LabelsetConfig;
use labelset_dataset::Dataset;
use labelset_patches::PatchesView;
use labelset_store::DocumentStore;

fn resolve_data_dir() -> PathBuf {
    std::env::var("LABELSET_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let exe_dir = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()));
            if let Some(dir) = exe_dir {
                let parent_data = dir.join("../data");
                if parent_data.exists() {
                    return parent_data;
                }
            }
            PathBuf::from("data")
        })
}

fn open_store() -> anyhow::Result<Arc<DocumentStore>> {
    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());
    let config = LabelsetConfig::from_env(&data_dir)?;
    let store = DocumentStore::from_config(&config)
        .map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;
    Ok(Arc::new(store))
}

fn print_help() {
    println!("labelset — dataset and patches inspection");
    println!();
    println!("Usage: labelset <command>");
    println!();
    println!("Commands:");
    println!("  datasets                         List datasets");
    println!("  info <dataset>                   Show a dataset's schema and evaluations");
    println!("  patches <dataset> <field>        Summarize the patches of a label field");
    println!("  eval-patches <dataset> <key>     Summarize evaluation patches (tp/fp/fn)");
    println!("  stats                            Show store statistics");
    println!("  help                             Show this help message");
    println!();
    println!("Environment:");
    println!("  LABELSET_DATA_DIR                Data directory (default: ./data)");
    println!("  LABELSET_RAND_SEED               Seed for patch sampling values");
    println!("  RUST_LOG                         Log filter (default: info)");
}

fn require<'a>(args: &'a [String], index: usize, usage: &str) -> &'a str {
    match args.get(index) {
        Some(arg) => arg,
        None => {
            eprintln!("Usage: {}", usage);
            std::process::exit(1);
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");

    match command {
        "datasets" => {
            let store = open_store()?;
            let names = store.list_dataset_names()?;
            if names.is_empty() {
                println!("No datasets");
            }
            for name in names.iter().filter(|n| !n.starts_with("_patches.")) {
                let dataset = Dataset::load(store.clone(), name)?;
                println!("{:<32} {:>8} samples", name, dataset.count()?);
            }
        }
        "info" => {
            let name = require(&args, 2, "labelset info <dataset>");
            let dataset = Dataset::load(open_store()?, name)?;
            report::print_dataset(&dataset)?;
        }
        "patches" => {
            let usage = "labelset patches <dataset> <field>";
            let name = require(&args, 2, usage);
            let field = require(&args, 3, usage);
            let dataset = Dataset::load(open_store()?, name)?;
            let patches = PatchesView::to_patches(&dataset.view(), field)?;
            report::print_patches(&patches)?;
            patches.delete()?;
        }
        "eval-patches" => {
            let usage = "labelset eval-patches <dataset> <eval_key>";
            let name = require(&args, 2, usage);
            let eval_key = require(&args, 3, usage);
            let dataset = Dataset::load(open_store()?, name)?;
            let patches = PatchesView::to_evaluation_patches(&dataset.view(), eval_key)?;
            report::print_evaluation_patches(&patches)?;
            patches.delete()?;
        }
        "stats" => {
            let stats = open_store()?.get_stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        "--help" | "-h" | "help" => print_help(),
        other => {
            eprintln!("Unknown command: {}. Use 'labelset help' for usage.", other);
            std::process::exit(1);
        }
    }

    Ok(())
}
