use crate::runmask::Cell;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

pub const BATCH_PREFIX: &str = "batch_";
pub const MANIFEST_FILE: &str = "batches.yaml";
pub const JOB_SCRIPT: &str = "slurm_runner.sh";
pub const RUN_STATUS_FILE: &str = "run_status.nc";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to access batch manifest {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Batch manifest is malformed")]
    Parse(#[from] serde_yaml::Error),
}

/// `batch_<index>`
pub fn batch_dir_name(index: usize) -> String {
    format!("{BATCH_PREFIX}{index}")
}

/// Parse the index out of `batch_<index>`, anything else is not a batch
pub fn parse_batch_index(name: &str) -> Option<usize> {
    let digits = name.strip_prefix(BATCH_PREFIX)?;

    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }

    digits.parse().ok()
}

/// Find the first path component that names a batch
pub fn batch_index_from_path(path: &Path) -> Option<usize> {
    path.components()
        .filter_map(|component| component.as_os_str().to_str())
        .find_map(parse_batch_index)
}

/// Job names correlate scheduler entries with batches
pub fn job_name(prefix: &str, index: usize) -> String {
    format!("{prefix}-batch-{index}")
}

pub fn index_from_job_name(name: &str) -> Option<usize> {
    let (_, index) = name.rsplit_once("-batch-")?;
    index.parse().ok()
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SplitMode {
    CellCount,
    SpatialSlice,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SplitAxis {
    X,
    Y,
}

impl SplitAxis {
    /// larger axis wins, ties go to Y
    pub fn larger(x_len: usize, y_len: usize) -> Self {
        if x_len > y_len {
            Self::X
        } else {
            Self::Y
        }
    }

    /// dimension name used by run mask, restart and status files
    pub fn upper(&self) -> &'static str {
        match self {
            Self::X => "X",
            Self::Y => "Y",
        }
    }

    /// dimension name used by time series outputs
    pub fn lower(&self) -> &'static str {
        match self {
            Self::X => "x",
            Self::Y => "y",
        }
    }
}

impl fmt::Display for SplitAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.upper())
    }
}

/// Paths of a single batch below the batch root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchPaths {
    pub index: usize,
    pub dir: PathBuf,
}

impl BatchPaths {
    pub fn new(root: &Path, index: usize) -> Self {
        Self {
            index,
            dir: root.join(batch_dir_name(index)),
        }
    }

    pub fn name(&self) -> String {
        batch_dir_name(self.index)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.join("output")
    }

    pub fn input_dir(&self) -> PathBuf {
        self.dir.join("input")
    }

    pub fn runmask(&self) -> PathBuf {
        self.dir.join("run-mask.nc")
    }

    /// run mask of the batch, in slice mode it lives with the other inputs
    pub fn existing_runmask(&self) -> Option<PathBuf> {
        [self.runmask(), self.input_dir().join("run-mask.nc")]
            .into_iter()
            .find(|path| path.is_file())
    }

    pub fn config(&self) -> PathBuf {
        self.dir.join("config").join("config.js")
    }

    pub fn script(&self) -> PathBuf {
        self.dir.join(JOB_SCRIPT)
    }

    pub fn run_status(&self) -> PathBuf {
        self.output_dir().join(RUN_STATUS_FILE)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BatchEntry {
    pub index: usize,
    // extent of the batch along the split axis
    pub extent: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cells: Vec<Cell>,
}

/// The batch arena written by the split and read back by status and merge
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BatchSet {
    pub mode: SplitMode,
    pub axis: SplitAxis,
    pub batches: Vec<BatchEntry>,
}

impl BatchSet {
    pub fn expected_count(&self) -> usize {
        self.batches.len()
    }

    pub fn cells(&self, index: usize) -> Option<&[Cell]> {
        self.batches
            .iter()
            .find(|entry| entry.index == index)
            .map(|entry| entry.cells.as_slice())
    }

    pub fn load(root: &Path) -> Result<Option<Self>, ManifestError> {
        let path = root.join(MANIFEST_FILE);

        if !path.is_file() {
            debug!(path = ?path, "No batch manifest present");
            return Ok(None);
        }

        let content = fs::read_to_string(&path).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;

        Ok(Some(serde_yaml::from_str(&content)?))
    }

    pub fn store(&self, root: &Path) -> Result<(), ManifestError> {
        let path = root.join(MANIFEST_FILE);
        let content = serde_yaml::to_string(self)?;

        fs::write(&path, content).map_err(|source| ManifestError::Io { path, source })
    }
}

/// Number of batches a merge expects, the manifest wins over what is on disk
pub fn expected_batch_count(manifest: Option<&BatchSet>, present: &[usize]) -> usize {
    match manifest {
        Some(manifest) => manifest.expected_count(),
        None => present.iter().max().map(|max| max + 1).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_names_round_trip() {
        assert_eq!(batch_dir_name(12), "batch_12");
        assert_eq!(parse_batch_index("batch_12"), Some(12));
        assert_eq!(parse_batch_index("batch_"), None);
        assert_eq!(parse_batch_index("batch_1a"), None);
        assert_eq!(parse_batch_index("logs"), None);
        assert_eq!(
            batch_index_from_path(Path::new("/work/output/batch_3/output/restart-eq.nc")),
            Some(3)
        );
        assert_eq!(batch_index_from_path(Path::new("/work/output/logs")), None);
    }

    #[test]
    fn job_names_carry_the_batch_index() {
        let name = job_name("four-basins", 7);

        assert_eq!(name, "four-basins-batch-7");
        assert_eq!(index_from_job_name(&name), Some(7));
        assert_eq!(index_from_job_name("slice input job"), None);
    }

    #[test]
    fn larger_axis_with_ties_to_y() {
        assert_eq!(SplitAxis::larger(10, 4), SplitAxis::X);
        assert_eq!(SplitAxis::larger(4, 10), SplitAxis::Y);
        assert_eq!(SplitAxis::larger(5, 5), SplitAxis::Y);
    }

    #[test]
    fn expected_count_falls_back_to_highest_index() {
        assert_eq!(expected_batch_count(None, &[0, 2, 5]), 6);
        assert_eq!(expected_batch_count(None, &[]), 0);

        let manifest = BatchSet {
            mode: SplitMode::SpatialSlice,
            axis: SplitAxis::Y,
            batches: (0..8)
                .map(|index| BatchEntry {
                    index,
                    extent: 1,
                    cells: Vec::new(),
                })
                .collect(),
        };

        assert_eq!(expected_batch_count(Some(&manifest), &[0, 2, 5]), 8);
    }
}
