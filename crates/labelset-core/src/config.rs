//! Configuration and data directory management.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Paths to all Labelset data directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// Document store directory (`data/db/`).
    pub db: PathBuf,
    /// Media directory that sample `filepath`s usually point into (`data/media/`).
    pub media: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            db: root.join("db"),
            media: root.join("media"),
            root,
        };
        paths.ensure_dirs()?;
        Ok(paths)
    }

    fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.db)?;
        std::fs::create_dir_all(&self.media)?;
        Ok(())
    }
}

/// Top-level Labelset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelsetConfig {
    /// Data directory paths.
    pub data_paths: DataPaths,
    /// Seed for the `_rand` values attached to patches. `None` draws from entropy.
    pub rand_seed: Option<u64>,
}

impl LabelsetConfig {
    /// Create configuration from environment and defaults.
    ///
    /// `LABELSET_RAND_SEED` pins the random scalars written by patch
    /// extraction so repeated materializations are byte-identical.
    pub fn from_env(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let rand_seed = match std::env::var("LABELSET_RAND_SEED") {
            Ok(raw) => match raw.parse() {
                Ok(seed) => Some(seed),
                Err(_) => {
                    warn!("Ignoring LABELSET_RAND_SEED={:?}: not an unsigned integer", raw);
                    None
                }
            },
            Err(_) => None,
        };

        let data_paths = DataPaths::new(data_dir)?;

        Ok(Self {
            data_paths,
            rand_seed,
        })
    }
}
