use crate::{
    arrays::{ArrayError, ArrayTool, Dataset, Variable},
    batch::{expected_batch_count, BatchPaths, BatchSet, ManifestError},
    collector::BatchTree,
    runmask::{Cell, RunMask},
};
use itertools::Itertools;
use ndarray::{Array2, Ix2};
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub const STATUS_VARIABLE: &str = "run_status";
pub const RUNTIME_VARIABLE: &str = "total_runtime";

#[derive(Error, Debug)]
pub enum StatusError {
    #[error(transparent)]
    Array(#[from] ArrayError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("{path}: {variable} must be a two dimensional grid")]
    Layout { path: PathBuf, variable: &'static str },
    #[error("No batches found below {0}")]
    NoBatches(PathBuf),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellOutcome {
    NeverRun,
    Failed(i64),
    Succeeded(i64),
}

impl CellOutcome {
    pub fn classify(value: f64, variable: &Variable) -> Self {
        if variable.is_fill(value) {
            return Self::NeverRun;
        }

        match value.round() as i64 {
            0 => Self::NeverRun,
            code if code < 0 => Self::Failed(code),
            code => Self::Succeeded(code),
        }
    }
}

/// `run_status` and `total_runtime` of one batch
#[derive(Debug, Clone)]
pub struct RunStatusGrid {
    pub status: Array2<f64>,
    status_variable: Variable,
    runtime: Option<Variable>,
}

impl RunStatusGrid {
    pub fn from_dataset(mut dataset: Dataset, path: &Path) -> Result<Self, StatusError> {
        let status_variable = dataset
            .variables
            .remove(STATUS_VARIABLE)
            .ok_or_else(|| ArrayError::MissingVariable(STATUS_VARIABLE.to_string()))?;
        let status = status_variable
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| StatusError::Layout {
                path: path.to_path_buf(),
                variable: STATUS_VARIABLE,
            })?
            .to_owned();

        let runtime = dataset.variables.remove(RUNTIME_VARIABLE);
        if runtime.is_none() {
            debug!(path = ?path, "No runtime variable in the status file");
        }

        Ok(Self {
            status,
            status_variable,
            runtime,
        })
    }

    pub fn load(tool: &dyn ArrayTool, path: &Path) -> Result<Self, StatusError> {
        Self::from_dataset(tool.read(path)?, path)
    }

    pub fn outcome(&self, cell: Cell) -> Option<CellOutcome> {
        self.status
            .get((cell.y, cell.x))
            .map(|value| CellOutcome::classify(*value, &self.status_variable))
    }

    pub fn cells(&self) -> Vec<Cell> {
        self.status
            .indexed_iter()
            .map(|((y, x), _)| Cell { y, x })
            .collect()
    }

    /// code -> number of cells, fill values and `sentinel` are skipped
    pub fn codes(&self, sentinel: f64) -> BTreeMap<i64, usize> {
        self.status
            .iter()
            .filter(|value| !self.status_variable.is_fill(**value) && **value != sentinel)
            .map(|value| value.round() as i64)
            .counts()
            .into_iter()
            .collect()
    }

    /// cells that did not succeed but still report a positive runtime
    pub fn runtime_violations(&self) -> usize {
        let Some(ref runtime) = self.runtime else {
            return 0;
        };

        self.status
            .indexed_iter()
            .filter(|(_, status)| {
                !matches!(
                    CellOutcome::classify(**status, &self.status_variable),
                    CellOutcome::Succeeded(_)
                )
            })
            .filter(|((y, x), _)| {
                runtime
                    .data
                    .get(ndarray::IxDyn(&[*y, *x]))
                    .map_or(false, |value| !runtime.is_fill(*value) && *value > 0.0)
            })
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStatus {
    pub index: usize,
    pub assigned: usize,
    pub succeeded: usize,
    pub never_run: usize,
    pub failed: Vec<(Cell, i64)>,
    pub status_missing: bool,
    // run status file exists but could not be decoded
    pub status_unreadable: bool,
    pub directory_missing: bool,
}

impl BatchStatus {
    pub fn name(&self) -> String {
        crate::batch::batch_dir_name(self.index)
    }

    pub fn flagged(&self) -> bool {
        self.directory_missing
            || self.status_missing
            || self.status_unreadable
            || self.never_run > 0
            || !self.failed.is_empty()
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.directory_missing {
            return write!(f, "{}: batch directory is missing", self.name());
        }

        write!(
            f,
            "{}: {} succeeded, {} failed, {} never run of {} cells",
            self.name(),
            self.succeeded,
            self.failed.len(),
            self.never_run,
            self.assigned
        )?;
        if self.status_missing {
            write!(f, " (no run status file)")?;
        }
        if self.status_unreadable {
            write!(f, " (run status file is unreadable)")?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub batches: Vec<BatchStatus>,
}

impl StatusReport {
    pub fn all_clear(&self) -> bool {
        !self.batches.iter().any(BatchStatus::flagged)
    }

    pub fn flagged(&self) -> impl Iterator<Item = &BatchStatus> {
        self.batches.iter().filter(|batch| batch.flagged())
    }

    pub fn failed_cells(&self) -> usize {
        self.batches.iter().map(|batch| batch.failed.len()).sum()
    }
}

/// Classifies every assigned cell of every batch
pub struct StatusChecker<'a> {
    tool: &'a dyn ArrayTool,
    tree: BatchTree,
}

impl<'a> StatusChecker<'a> {
    pub fn new(tool: &'a dyn ArrayTool, batch_root: &Path) -> Self {
        Self {
            tool,
            tree: BatchTree::new(batch_root),
        }
    }

    fn assigned_cells(
        &self,
        batch: &BatchPaths,
        manifest: Option<&BatchSet>,
    ) -> Option<Vec<Cell>> {
        if let Some(mask) = batch.existing_runmask() {
            match RunMask::load(self.tool, &mask) {
                Ok(mask) => return Some(mask.enabled_cells()),
                Err(error) => warn!(batch = %batch.name(), error = %error, "Failed to read run mask, using the manifest"),
            }
        }

        manifest
            .and_then(|manifest| manifest.cells(batch.index))
            .filter(|cells| !cells.is_empty())
            .map(<[Cell]>::to_vec)
    }

    pub fn check_batch(&self, batch: &BatchPaths, manifest: Option<&BatchSet>) -> Result<BatchStatus, StatusError> {
        let assigned = self.assigned_cells(batch, manifest);
        let path = batch.run_status();
        let mut status = BatchStatus {
            index: batch.index,
            ..Default::default()
        };

        if !path.is_file() {
            status.status_missing = true;
            status.assigned = assigned.as_ref().map_or(0, Vec::len);
            status.never_run = status.assigned;
            return Ok(status);
        }

        let grid = match RunStatusGrid::load(self.tool, &path) {
            Ok(grid) => grid,
            Err(error) => {
                warn!(batch = %batch.name(), error = %error, "Failed to read run status");
                status.status_unreadable = true;
                status.assigned = assigned.as_ref().map_or(0, Vec::len);
                return Ok(status);
            }
        };
        let cells = assigned.unwrap_or_else(|| grid.cells());
        status.assigned = cells.len();

        for cell in cells {
            match grid.outcome(cell) {
                Some(CellOutcome::Succeeded(_)) => status.succeeded += 1,
                Some(CellOutcome::Failed(code)) => status.failed.push((cell, code)),
                Some(CellOutcome::NeverRun) => status.never_run += 1,
                None => {
                    warn!(batch = %batch.name(), cell = %cell, "Assigned cell is outside of the run status grid");
                    status.never_run += 1;
                }
            }
        }

        let violations = grid.runtime_violations();
        if violations > 0 {
            warn!(
                batch = %batch.name(),
                cells = violations,
                "Cells without success report a positive runtime"
            );
        }

        Ok(status)
    }

    #[instrument(skip(self), fields(root = ?self.tree.root))]
    pub fn check(&self) -> Result<StatusReport, StatusError> {
        let manifest = BatchSet::load(&self.tree.root)?;
        let present = self.tree.batches();
        let indices: Vec<usize> = present.iter().map(|batch| batch.index).collect();
        let expected = expected_batch_count(manifest.as_ref(), &indices);

        if expected == 0 {
            return Err(StatusError::NoBatches(self.tree.root.clone()));
        }

        let mut report = StatusReport::default();
        for index in 0..expected {
            match present.iter().find(|batch| batch.index == index) {
                Some(batch) => report.batches.push(self.check_batch(batch, manifest.as_ref())?),
                None => report.batches.push(BatchStatus {
                    index,
                    assigned: manifest
                        .as_ref()
                        .and_then(|manifest| manifest.cells(index))
                        .map_or(0, <[Cell]>::len),
                    directory_missing: true,
                    ..Default::default()
                }),
            }
        }

        info!(
            batches = report.batches.len(),
            flagged = report.flagged().count(),
            "Run status check finished"
        );
        Ok(report)
    }
}

/// batches grouped by the number of files in their output folder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileCountReport {
    pub counts: BTreeMap<usize, Vec<usize>>,
}

impl FileCountReport {
    pub fn collect(tree: &BatchTree) -> Self {
        let mut counts: BTreeMap<usize, Vec<usize>> = BTreeMap::new();

        for (index, files) in tree.output_file_counts() {
            counts.entry(files).or_default().push(index);
        }

        Self { counts }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn is_uniform(&self) -> bool {
        self.counts.len() <= 1
    }

    pub fn lines(&self) -> Vec<String> {
        let names = |batches: &[usize]| {
            batches
                .iter()
                .sorted()
                .map(|index| crate::batch::batch_dir_name(*index))
                .join(", ")
        };

        let Some((&max_files, _)) = self.counts.last_key_value() else {
            return vec!["No batch folders found.".to_string()];
        };

        if self.is_uniform() {
            let batches = self.counts.values().map(Vec::len).sum::<usize>();
            return vec![format!("All {batches} batch folders have {max_files} output files.")];
        }

        let mut lines = vec!["Batch folders have different numbers of output files:".to_string()];
        lines.push(format!(
            "- {} batches with {max_files} files: {}",
            self.counts[&max_files].len(),
            names(&self.counts[&max_files])
        ));

        for (files, batches) in self.counts.iter().filter(|(files, _)| **files != max_files) {
            lines.push(format!(
                "- {} batches with {files} files ({} missing): {}",
                batches.len(),
                max_files - files,
                names(batches)
            ));
        }

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arrays::{dataset::tests::grid, NativeTool},
        batch::{BatchEntry, SplitAxis, SplitMode},
    };
    use ndarray::Array2;
    use std::fs;

    fn status_grid(values: Array2<f64>) -> Dataset {
        let mut dataset = grid(STATUS_VARIABLE, values.clone(), -9999.0);
        let runtime = grid(
            RUNTIME_VARIABLE,
            values.mapv(|status| if status > 0.0 { 12.0 } else { -9999.0 }),
            -9999.0,
        );
        dataset
            .variables
            .extend(runtime.variables.into_iter());
        dataset
    }

    #[test]
    fn status_codes_are_classified() {
        let variable = grid(STATUS_VARIABLE, Array2::zeros((1, 1)), -9999.0)
            .variables
            .remove(STATUS_VARIABLE)
            .unwrap();

        assert_eq!(CellOutcome::classify(100.0, &variable), CellOutcome::Succeeded(100));
        assert_eq!(CellOutcome::classify(-3.0, &variable), CellOutcome::Failed(-3));
        assert_eq!(CellOutcome::classify(0.0, &variable), CellOutcome::NeverRun);
        assert_eq!(CellOutcome::classify(-9999.0, &variable), CellOutcome::NeverRun);
        assert_eq!(CellOutcome::classify(f64::NAN, &variable), CellOutcome::NeverRun);
    }

    #[test]
    fn failing_cells_flag_their_batch() {
        let root = tempfile::tempdir().unwrap();
        let tool = NativeTool;
        let batch = BatchPaths::new(root.path(), 0);

        // 10x10 grid: 2 failed cells, 8 successes, the rest never ran
        let mut values = Array2::zeros((10, 10));
        values[[0, 3]] = -1.0;
        values[[4, 4]] = -7.0;
        for x in 0..8 {
            values[[9, x]] = 100.0;
        }
        tool.write(&status_grid(values), &batch.run_status()).unwrap();

        let checker = StatusChecker::new(&tool, root.path());
        let report = checker.check().unwrap();

        assert!(!report.all_clear());
        assert_eq!(report.failed_cells(), 2);
        let status = &report.batches[0];
        assert_eq!(status.assigned, 100);
        assert_eq!(status.succeeded, 8);
        assert_eq!(status.never_run, 90);
        assert_eq!(
            status.failed,
            vec![(Cell { y: 0, x: 3 }, -1), (Cell { y: 4, x: 4 }, -7)]
        );
    }

    #[test]
    fn only_assigned_cells_count() {
        let root = tempfile::tempdir().unwrap();
        let tool = NativeTool;

        let mut values = Array2::zeros((2, 3));
        values[[0, 0]] = 100.0;
        values[[0, 1]] = 100.0;

        let mut mask = Array2::zeros((2, 3));
        mask[[0, 0]] = 1.0;
        mask[[0, 1]] = 1.0;

        let batch = BatchPaths::new(root.path(), 0);
        tool.write(&status_grid(values), &batch.run_status()).unwrap();
        tool.write(&grid("run", mask, -9999.0), &batch.runmask()).unwrap();

        let report = StatusChecker::new(&tool, root.path()).check().unwrap();
        assert!(report.all_clear());
        assert_eq!(report.batches[0].assigned, 2);
    }

    #[test]
    fn missing_batches_are_flagged() {
        let root = tempfile::tempdir().unwrap();
        let tool = NativeTool;
        let cells = |y: usize| vec![Cell { y, x: 0 }];

        BatchSet {
            mode: SplitMode::CellCount,
            axis: SplitAxis::Y,
            batches: (0..3)
                .map(|index| BatchEntry {
                    index,
                    extent: 3,
                    cells: cells(index),
                })
                .collect(),
        }
        .store(root.path())
        .unwrap();
        fs::create_dir_all(BatchPaths::new(root.path(), 0).output_dir()).unwrap();
        fs::create_dir_all(BatchPaths::new(root.path(), 2).output_dir()).unwrap();

        let report = StatusChecker::new(&tool, root.path()).check().unwrap();
        let flagged: Vec<_> = report.flagged().map(|batch| batch.index).collect();

        assert_eq!(flagged, vec![0, 1, 2]);
        assert!(report.batches[1].directory_missing);
        assert!(report.batches[0].status_missing);
        assert_eq!(report.batches[0].never_run, 1);
    }

    #[test]
    fn status_codes_are_summarised() {
        let mut values = Array2::from_elem((2, 2), 100.0);
        values[[1, 1]] = -99.0;
        values[[1, 0]] = -5.0;
        let grid = RunStatusGrid::from_dataset(status_grid(values), Path::new("run_status.nc")).unwrap();

        assert_eq!(grid.codes(-99.0), BTreeMap::from([(-5, 1), (100, 2)]));
        assert_eq!(grid.runtime_violations(), 0);
    }

    #[test]
    fn file_counts_are_grouped() {
        let report = FileCountReport {
            counts: BTreeMap::from([(12, vec![0, 1, 3]), (0, vec![2]), (10, vec![4])]),
        };

        assert_eq!(
            report.lines(),
            vec![
                "Batch folders have different numbers of output files:",
                "- 3 batches with 12 files: batch_0, batch_1, batch_3",
                "- 1 batches with 0 files (12 missing): batch_2",
                "- 1 batches with 10 files (2 missing): batch_4",
            ]
        );

        let uniform = FileCountReport {
            counts: BTreeMap::from([(12, vec![0, 1])]),
        };
        assert_eq!(uniform.lines(), vec!["All 2 batch folders have 12 output files."]);
    }
}
