use crate::batch::{parse_batch_index, BatchPaths};
use globset::{GlobBuilder, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// map of output file name -> instances sorted by batch index
pub type OutputGroups = BTreeMap<String, Vec<(usize, PathBuf)>>;

/// View on a batch root directory (`<root>/batch_<i>/...`)
#[derive(Debug, Clone)]
pub struct BatchTree {
    pub root: PathBuf,
}

fn read_dir_sorted(path: &Path) -> Vec<PathBuf> {
    match fs::read_dir(path) {
        Ok(entries) => entries
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.path()),
                Err(error) => {
                    warn!(error = ?error, path = ?path, "Failed to read directory entry");
                    None
                }
            })
            .sorted()
            .collect(),
        Err(error) => {
            debug!(error = ?error, path = ?path, "Directory is not readable");
            Vec::new()
        }
    }
}

impl BatchTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// all existing batch directories sorted by their index
    pub fn batches(&self) -> Vec<BatchPaths> {
        read_dir_sorted(&self.root)
            .into_iter()
            .filter(|path| path.is_dir())
            .filter_map(|path| {
                let index = parse_batch_index(path.file_name()?.to_str()?)?;
                Some(BatchPaths { index, dir: path })
            })
            .sorted_by_key(|batch| batch.index)
            .collect()
    }

    pub fn indices(&self) -> Vec<usize> {
        self.batches().into_iter().map(|batch| batch.index).collect()
    }

    pub fn output_files(batch: &BatchPaths) -> Vec<PathBuf> {
        read_dir_sorted(&batch.output_dir())
            .into_iter()
            .filter(|path| path.is_file())
            .collect()
    }

    /// group output files of every batch by file name
    pub fn output_groups(&self) -> OutputGroups {
        let mut groups = OutputGroups::new();

        for batch in self.batches() {
            for path in Self::output_files(&batch) {
                if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                    groups
                        .entry(name.to_string())
                        .or_default()
                        .push((batch.index, path.clone()));
                }
            }
        }

        for instances in groups.values_mut() {
            instances.sort_by_key(|(index, _)| *index);
        }

        groups
    }

    /// number of output files per batch
    pub fn output_file_counts(&self) -> Vec<(usize, usize)> {
        self.batches()
            .iter()
            .map(|batch| (batch.index, Self::output_files(batch).len()))
            .collect()
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// scheduler logs (`*.out`) below the log directory
    pub fn log_files(&self) -> Vec<PathBuf> {
        read_dir_sorted(&self.log_dir())
            .into_iter()
            .filter(|path| path.is_file() && path.extension().map_or(false, |ext| ext == "out"))
            .collect()
    }

    /// Find all files below the root matching `glob`
    pub fn find(&self, glob: &str, max_depth: usize) -> Result<Vec<PathBuf>, globset::Error> {
        let matcher: GlobMatcher = GlobBuilder::new(glob)
            .literal_separator(false)
            .build()?
            .compile_matcher();
        debug!("Filtering with glob: {matcher:?}");

        let mut builder = WalkBuilder::new(&self.root);
        builder.standard_filters(false).max_depth(Some(max_depth));

        Ok(builder
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(error) => {
                    warn!("Failed to search batch tree: {error}");
                    None
                }
            })
            .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
            .map(DirEntry::into_path)
            .filter(|path| {
                path.strip_prefix(&self.root)
                    .map_or(false, |relative| matcher.is_match(relative))
            })
            .sorted()
            .collect())
    }
}
